use crate::{KeepError, KeepResult};
use std::fmt;
use std::str::FromStr;

/// A parsed block locator: `<md5-hex:32>+<size>` followed by zero or more
/// `+X...` hints. Hints are kept verbatim so unknown kinds survive a
/// parse/emit round trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locator {
    hash: String,
    size: u64,
    hints: Vec<String>,
}

fn is_hex_lower(b: u8) -> bool {
    b.is_ascii_digit() || (b'a'..=b'f').contains(&b)
}

fn is_hint_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'@' | b'-')
}

impl Locator {
    pub fn parse(s: &str) -> KeepResult<Self> {
        let mut parts = s.split('+');
        let hash = parts
            .next()
            .filter(|h| h.len() == 32 && h.bytes().all(is_hex_lower))
            .ok_or_else(|| KeepError::BadLocator(s.to_string()))?;
        let size = parts
            .next()
            .filter(|f| !f.is_empty() && f.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|f| f.parse::<u64>().ok())
            .ok_or_else(|| KeepError::BadLocator(s.to_string()))?;
        let mut hints = Vec::new();
        for hint in parts {
            let ok = hint
                .as_bytes()
                .first()
                .map(|b| b.is_ascii_uppercase())
                .unwrap_or(false)
                && hint.bytes().skip(1).all(is_hint_byte);
            if !ok {
                return Err(KeepError::BadLocator(s.to_string()));
            }
            hints.push(hint.to_string());
        }
        Ok(Locator {
            hash: hash.to_string(),
            size,
            hints,
        })
    }

    /// The 32-char content hash. The core never addresses a block by
    /// anything else.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn hints(&self) -> &[String] {
        &self.hints
    }

    /// Canonical `hash+size` form with every hint removed.
    pub fn stripped(&self) -> String {
        format!("{}+{}", self.hash, self.size)
    }

    /// Expiry timestamp (unix seconds) of the last `+A` hint, if that hint
    /// carries a parseable `@<hex>` suffix.
    pub fn expiry(&self) -> Option<u64> {
        let hint = self.hints.iter().rev().find(|h| h.starts_with('A'))?;
        let (_, ts) = hint.rsplit_once('@')?;
        u64::from_str_radix(ts, 16).ok()
    }

    pub fn is_signed(&self) -> bool {
        self.hints.iter().any(|h| h.starts_with('A'))
    }

    /// True if the locator carries a `+R` remote-cluster hint, which must
    /// be converted to a local `+A` signature before a manifest is emitted.
    pub fn is_remote(&self) -> bool {
        self.hints.iter().any(|h| h.starts_with('R'))
    }

    /// Copy with all `+A` and `+R` hints removed; other hints stay.
    pub fn without_signatures(&self) -> Locator {
        Locator {
            hash: self.hash.clone(),
            size: self.size,
            hints: self
                .hints
                .iter()
                .filter(|h| !h.starts_with('A') && !h.starts_with('R'))
                .cloned()
                .collect(),
        }
    }

    pub fn push_hint(&mut self, hint: String) {
        self.hints.push(hint);
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.hash, self.size)?;
        for hint in &self.hints {
            write!(f, "+{}", hint)?;
        }
        Ok(())
    }
}

impl FromStr for Locator {
    type Err = KeepError;

    fn from_str(s: &str) -> KeepResult<Self> {
        Locator::parse(s)
    }
}

/// Truncate a locator string to its `hash+size` prefix without a full
/// parse. Used as the canonical key when rewriting segment references.
pub fn strip_all_hints(locator: &str) -> String {
    let mut parts = locator.splitn(3, '+');
    match (parts.next(), parts.next()) {
        (Some(hash), Some(size)) => format!("{}+{}", hash, size),
        _ => locator.to_string(),
    }
}
