//! Manifest codec: parses manifest text into a tree and reserializes the
//! tree in canonical form.
//!
//! A manifest is one stream per line:
//!
//! ```text
//! <stream-path> <locator>... <offset>:<length>:<name>... \n
//! ```
//!
//! Stream paths start with `.`; path bytes <= 0x20, backslash, colon, and
//! slash are escaped as 3-digit octal `\ooo`. Canonical output orders
//! streams by unescaped path, lists each stream's locators in first
//! reference order, and emits each file's extents in file order.

use crate::node::{FsTree, Node, NodeId};
use crate::segment::{Segment, StoredSegment};
use keep_lib::{KeepError, KeepResult, Locator, EMPTY_BLOCK_LOCATOR};
use std::collections::HashMap;

/// Canonical manifest spelling of a `.` fileseg name, used to mark empty
/// directories.
const DIR_MARKER: &str = "\\056";

pub(crate) fn escape_component(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c <= '\u{20}' || c == '\\' || c == ':' || c == '/' {
            out.push_str(&format!("\\{:03o}", c as u32));
        } else {
            out.push(c);
        }
    }
    out
}

pub(crate) fn unescape_component(token: &str) -> KeepResult<String> {
    let bytes = token.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b < 0x20 {
            return Err(KeepError::BadManifest(format!(
                "unescaped control byte {:#04x} in {:?}",
                b, token
            )));
        }
        if b == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|d| (b'0'..=b'7').contains(d))
        {
            let val = (bytes[i + 1] - b'0') as u32 * 64
                + (bytes[i + 2] - b'0') as u32 * 8
                + (bytes[i + 3] - b'0') as u32;
            if val > 0xff {
                return Err(KeepError::BadManifest(format!(
                    "octal escape out of range in {:?}",
                    token
                )));
            }
            out.push(val as u8);
            i += 4;
        } else {
            out.push(b);
            i += 1;
        }
    }
    String::from_utf8(out)
        .map_err(|_| KeepError::BadManifest(format!("name is not valid UTF-8: {:?}", token)))
}

fn bad(line_no: usize, msg: impl std::fmt::Display) -> KeepError {
    KeepError::BadManifest(format!("line {}: {}", line_no + 1, msg))
}

/// Parse manifest text into `tree`. The tree must be freshly created; a
/// parse error leaves it in an unspecified state.
pub(crate) fn parse_manifest(tree: &mut FsTree, text: &str) -> KeepResult<()> {
    if text.is_empty() {
        return Ok(());
    }
    let body = text
        .strip_suffix('\n')
        .ok_or_else(|| KeepError::BadManifest("does not end with newline".to_string()))?;
    for (line_no, line) in body.split('\n').enumerate() {
        parse_stream(tree, line_no, line)?;
    }
    Ok(())
}

fn parse_stream(tree: &mut FsTree, line_no: usize, line: &str) -> KeepResult<()> {
    let mut tokens = line.split(' ');
    let stream_tok = tokens.next().unwrap_or("");
    let stream_dir = resolve_stream_path(tree, line_no, stream_tok)?;

    // Leading locator tokens, then fileseg tokens. An empty token anywhere
    // means doubled or trailing spaces.
    let mut locators: Vec<(String, u64)> = Vec::new();
    let mut bases: Vec<u64> = vec![0];
    let mut filesegs_seen = false;
    // Interleaved manifests repeat the same name thousands of times per
    // stream; remember resolved file nodes instead of re-walking.
    let mut fnode_cache: HashMap<String, NodeId> = HashMap::new();

    for tok in tokens {
        if tok.is_empty() {
            return Err(bad(line_no, "empty token (doubled or trailing space)"));
        }
        if !filesegs_seen {
            if let Ok(loc) = Locator::parse(tok) {
                bases.push(bases.last().unwrap() + loc.size());
                locators.push((tok.to_string(), loc.size()));
                continue;
            }
            filesegs_seen = true;
            if locators.is_empty() {
                return Err(bad(line_no, "no block locators before file segments"));
            }
        }
        parse_fileseg(
            tree,
            line_no,
            stream_dir,
            &locators,
            &bases,
            &mut fnode_cache,
            tok,
        )?;
    }
    if locators.is_empty() {
        return Err(bad(line_no, "stream has no block locators"));
    }
    if !filesegs_seen {
        return Err(bad(line_no, "stream has no file segments"));
    }
    Ok(())
}

fn resolve_stream_path(tree: &mut FsTree, line_no: usize, tok: &str) -> KeepResult<NodeId> {
    let mut comps = tok.split('/');
    if comps.next() != Some(".") {
        return Err(bad(line_no, format!("stream path must start with '.': {:?}", tok)));
    }
    let mut names = Vec::new();
    for comp in comps {
        let name = unescape_component(comp)?;
        if name.is_empty() || name == "." || name == ".." {
            return Err(bad(line_no, format!("invalid stream path component {:?}", name)));
        }
        names.push(name);
    }
    let root = tree.root;
    tree.mkdir_p(root, &names)
        .map_err(|e| bad(line_no, format!("stream path {:?}: {}", tok, e)))
}

fn parse_fileseg(
    tree: &mut FsTree,
    line_no: usize,
    stream_dir: NodeId,
    locators: &[(String, u64)],
    bases: &[u64],
    fnode_cache: &mut HashMap<String, NodeId>,
    tok: &str,
) -> KeepResult<()> {
    let mut parts = tok.splitn(3, ':');
    let offset = parse_decimal(parts.next().unwrap_or(""))
        .ok_or_else(|| bad(line_no, format!("bad file segment offset in {:?}", tok)))?;
    let length = parts
        .next()
        .and_then(parse_decimal)
        .ok_or_else(|| bad(line_no, format!("bad file segment length in {:?}", tok)))?;
    let name_tok = parts
        .next()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| bad(line_no, format!("missing file segment name in {:?}", tok)))?;
    let name = unescape_component(name_tok)?;

    let stream_total = *bases.last().unwrap();
    if offset + length > stream_total {
        return Err(bad(
            line_no,
            format!(
                "segment {}:{} extends past stream blocks ({} bytes)",
                offset, length, stream_total
            ),
        ));
    }

    let file_id = match fnode_cache.get(&name) {
        Some(&id) => id,
        None => {
            let id = resolve_fileseg_name(tree, line_no, stream_dir, &name, length)?;
            match id {
                Some(id) => {
                    fnode_cache.insert(name, id);
                    id
                }
                // Directory marker; nothing else to do.
                None => return Ok(()),
            }
        }
    };

    if length == 0 {
        return Ok(());
    }

    // Map [offset, offset+length) onto the stream's blocks. `bases` is the
    // prefix-sum table, so the first block is found by binary search.
    let mut remain = length;
    let mut pos = offset;
    let mut idx = bases.partition_point(|&b| b <= pos) - 1;
    let file = tree.file_mut(file_id)?;
    while remain > 0 {
        let (loc, size) = &locators[idx];
        let block_off = pos - bases[idx];
        let take = remain.min(size - block_off);
        if take > 0 {
            file.segments.push(Segment::Stored(StoredSegment {
                locator: loc.clone(),
                size: *size,
                offset: block_off,
                length: take,
            }));
            remain -= take;
            pos += take;
        }
        idx += 1;
    }
    file.size += length;
    Ok(())
}

/// Validate a fileseg name and find or create its node. Returns None for
/// a directory marker (`.` or a name ending in `/.`), which creates the
/// directory and no file.
fn resolve_fileseg_name(
    tree: &mut FsTree,
    line_no: usize,
    stream_dir: NodeId,
    name: &str,
    length: u64,
) -> KeepResult<Option<NodeId>> {
    let comps: Vec<&str> = name.split('/').collect();
    for comp in &comps {
        if comp.is_empty() || *comp == ".." {
            return Err(bad(line_no, format!("invalid name {:?}", name)));
        }
    }
    if comps[..comps.len() - 1].iter().any(|c| *c == ".") {
        return Err(bad(line_no, format!("invalid name {:?}", name)));
    }

    let dirs: Vec<String> = comps[..comps.len() - 1]
        .iter()
        .map(|s| s.to_string())
        .collect();
    if comps[comps.len() - 1] == "." {
        // Directory marker (e.g. `0:0:\056` or `0:0:sub/.`).
        if length != 0 {
            return Err(bad(line_no, format!("non-empty segment named {:?}", name)));
        }
        tree.mkdir_p(stream_dir, &dirs)
            .map_err(|e| bad(line_no, format!("{:?}: {}", name, e)))?;
        return Ok(None);
    }

    let parent = tree
        .mkdir_p(stream_dir, &dirs)
        .map_err(|e| bad(line_no, format!("{:?}: {}", name, e)))?;
    let fname = comps[comps.len() - 1].to_string();
    match tree.dir(parent)?.children.get(&fname).copied() {
        Some(id) => {
            if tree.node(id).is_dir() {
                return Err(bad(
                    line_no,
                    format!("{:?} is both a file and a directory", name),
                ));
            }
            Ok(Some(id))
        }
        None => {
            let id = tree.alloc(Node::File(crate::node::FileNode::new()));
            tree.dir_mut(parent)?.children.insert(fname, id);
            Ok(Some(id))
        }
    }
}

fn parse_decimal(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Serialize the tree as a canonical manifest. Every file segment must be
/// stored (flushed) and carry no `+R` hint.
pub(crate) fn emit_manifest(tree: &FsTree) -> KeepResult<String> {
    let mut streams: Vec<(String, NodeId)> = Vec::new();
    collect_streams(tree, tree.root, ".".to_string(), &mut streams);
    streams.sort_by(|a, b| a.0.cmp(&b.0));

    let mut out = String::new();
    for (path, dir_id) in streams {
        emit_stream(tree, &path, dir_id, &mut out)?;
    }
    Ok(out)
}

fn collect_streams(tree: &FsTree, id: NodeId, path: String, out: &mut Vec<(String, NodeId)>) {
    if let Node::Dir(dir) = tree.node(id) {
        let has_files = dir
            .children
            .values()
            .any(|&c| !tree.node(c).is_dir());
        if has_files || (dir.children.is_empty() && id != tree.root) {
            out.push((path.clone(), id));
        }
        for (name, &child) in &dir.children {
            if tree.node(child).is_dir() {
                collect_streams(tree, child, format!("{}/{}", path, name), out);
            }
        }
    }
}

fn escape_stream_path(path: &str) -> String {
    // `path` is "." or "./a/b" built from unescaped names.
    let mut comps = path.split('/');
    let mut out = comps.next().unwrap_or(".").to_string();
    for comp in comps {
        out.push('/');
        out.push_str(&escape_component(comp));
    }
    out
}

fn emit_stream(tree: &FsTree, path: &str, dir_id: NodeId, out: &mut String) -> KeepResult<()> {
    let dir = tree.dir(dir_id)?;
    let files: Vec<(&String, NodeId)> = dir
        .children
        .iter()
        .filter(|(_, &id)| !tree.node(id).is_dir())
        .map(|(name, &id)| (name, id))
        .collect();

    out.push_str(&escape_stream_path(path));
    if files.is_empty() {
        out.push(' ');
        out.push_str(EMPTY_BLOCK_LOCATOR);
        out.push_str(" 0:0:");
        out.push_str(DIR_MARKER);
        out.push('\n');
        return Ok(());
    }

    // Blocks in first-reference order, with their base offset in the
    // stream's concatenated block space.
    let mut block_order: Vec<String> = Vec::new();
    let mut block_base: HashMap<String, u64> = HashMap::new();
    let mut total = 0u64;
    let mut file_tokens: Vec<String> = Vec::new();

    for (name, file_id) in files {
        let file = tree.file(file_id)?;
        let mut extents: Vec<(u64, u64)> = Vec::new();
        for seg in &file.segments {
            let stored = match seg {
                Segment::Stored(s) => s,
                Segment::Memory(_) => {
                    return Err(KeepError::Internal(format!(
                        "cannot emit manifest: {:?} has unflushed data",
                        name
                    )))
                }
            };
            let loc = Locator::parse(&stored.locator)?;
            if loc.is_remote() {
                return Err(KeepError::UnresolvedRemote(stored.locator.clone()));
            }
            let key = loc.stripped();
            let base = *block_base.entry(key).or_insert_with(|| {
                block_order.push(stored.locator.clone());
                let base = total;
                total += stored.size;
                base
            });
            let pos = base + stored.offset;
            match extents.last_mut() {
                Some((start, len)) if *start + *len == pos => *len += stored.length,
                _ => extents.push((pos, stored.length)),
            }
        }
        if extents.is_empty() {
            extents.push((0, 0));
        }
        let escaped = escape_component(name);
        for (pos, len) in extents {
            file_tokens.push(format!("{}:{}:{}", pos, len, escaped));
        }
    }

    if block_order.is_empty() {
        block_order.push(EMPTY_BLOCK_LOCATOR.to_string());
    }
    for loc in &block_order {
        out.push(' ');
        out.push_str(loc);
    }
    for tok in &file_tokens {
        out.push(' ');
        out.push_str(tok);
    }
    out.push('\n');
    Ok(())
}
