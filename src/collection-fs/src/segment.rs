use keep_lib::BlockSegment;
use std::sync::Arc;

/// Flat accounting overhead charged per segment and per inode when
/// reporting `memory_size`.
pub(crate) const ACCOUNTING_OVERHEAD: u64 = 64;

/// A run of bytes buffered in memory, waiting to be packed into a stored
/// block. After a split, both halves reference the same buffer with
/// disjoint ranges; buffers are never shared across file nodes.
#[derive(Debug, Clone)]
pub(crate) struct MemSegment {
    pub buf: Arc<Vec<u8>>,
    pub off: usize,
    pub len: usize,
    /// Set while a background or synchronous flush has copied this
    /// segment's bytes out and owns its replacement.
    pub flushing: bool,
}

impl MemSegment {
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            buf: Arc::new(data.to_vec()),
            off: 0,
            len: data.len(),
            flushing: false,
        }
    }

    pub fn zeros(len: usize) -> Self {
        Self {
            buf: Arc::new(vec![0u8; len]),
            off: 0,
            len,
            flushing: false,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf[self.off..self.off + self.len]
    }

    /// Identity triple used to re-find this exact segment after lock-free
    /// upload I/O. Two segments compare equal only if they reference the
    /// same buffer object over the same range.
    pub fn ident(&self) -> SegIdent {
        SegIdent {
            buf: Arc::as_ptr(&self.buf) as usize,
            off: self.off,
            len: self.len,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SegIdent {
    buf: usize,
    off: usize,
    len: usize,
}

/// A byte range inside an immutable stored block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSegment {
    pub locator: String,
    /// Total size of the referenced block.
    pub size: u64,
    /// Start of this segment within the block.
    pub offset: u64,
    pub length: u64,
}

impl StoredSegment {
    pub fn block_segment(&self) -> BlockSegment {
        BlockSegment::new(self.locator.clone(), self.offset, self.length)
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Segment {
    Memory(MemSegment),
    Stored(StoredSegment),
}

impl Segment {
    pub fn len(&self) -> u64 {
        match self {
            Segment::Memory(m) => m.len as u64,
            Segment::Stored(s) => s.length,
        }
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, Segment::Memory(_))
    }

    pub fn memory_size(&self) -> u64 {
        match self {
            Segment::Memory(m) => m.buf.len() as u64 + ACCOUNTING_OVERHEAD,
            Segment::Stored(s) => s.locator.len() as u64 + ACCOUNTING_OVERHEAD,
        }
    }

    /// Split without copying: both sides keep referencing the original
    /// buffer or block. `at` must be within `0..=len`.
    pub fn split(&self, at: u64) -> (Segment, Segment) {
        debug_assert!(at <= self.len());
        match self {
            Segment::Memory(m) => {
                let at = at as usize;
                (
                    Segment::Memory(MemSegment {
                        buf: m.buf.clone(),
                        off: m.off,
                        len: at,
                        flushing: false,
                    }),
                    Segment::Memory(MemSegment {
                        buf: m.buf.clone(),
                        off: m.off + at,
                        len: m.len - at,
                        flushing: false,
                    }),
                )
            }
            Segment::Stored(s) => (
                Segment::Stored(StoredSegment {
                    locator: s.locator.clone(),
                    size: s.size,
                    offset: s.offset,
                    length: at,
                }),
                Segment::Stored(StoredSegment {
                    locator: s.locator.clone(),
                    size: s.size,
                    offset: s.offset + at,
                    length: s.length - at,
                }),
            ),
        }
    }

    /// Coalesce two memory segments that reference contiguous ranges of
    /// the same buffer object. Anything else stays split.
    pub fn try_merge(a: &Segment, b: &Segment) -> Option<Segment> {
        match (a, b) {
            (Segment::Memory(x), Segment::Memory(y))
                if Arc::ptr_eq(&x.buf, &y.buf)
                    && x.off + x.len == y.off
                    && !x.flushing
                    && !y.flushing =>
            {
                Some(Segment::Memory(MemSegment {
                    buf: x.buf.clone(),
                    off: x.off,
                    len: x.len + y.len,
                    flushing: false,
                }))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_memory() {
        let seg = Segment::Memory(MemSegment::from_slice(b"foobar"));
        let (l, r) = seg.split(4);
        match (&l, &r) {
            (Segment::Memory(a), Segment::Memory(b)) => {
                assert_eq!(a.bytes(), b"foob");
                assert_eq!(b.bytes(), b"ar");
                assert!(Arc::ptr_eq(&a.buf, &b.buf));
            }
            _ => panic!("split changed variant"),
        }
    }

    #[test]
    fn test_split_stored() {
        let seg = Segment::Stored(StoredSegment {
            locator: "3858f62230ac3c915f300c664312c63f+6".to_string(),
            size: 6,
            offset: 1,
            length: 4,
        });
        let (l, r) = seg.split(1);
        match (&l, &r) {
            (Segment::Stored(a), Segment::Stored(b)) => {
                assert_eq!((a.offset, a.length), (1, 1));
                assert_eq!((b.offset, b.length), (2, 3));
            }
            _ => panic!("split changed variant"),
        }
    }

    #[test]
    fn test_merge_same_buffer_only() {
        let whole = Segment::Memory(MemSegment::from_slice(b"abcdef"));
        let (l, r) = whole.split(3);
        let merged = Segment::try_merge(&l, &r).expect("contiguous halves merge");
        assert_eq!(merged.len(), 6);

        // Same content, different buffer object: no merge.
        let other = Segment::Memory(MemSegment::from_slice(b"def"));
        assert!(Segment::try_merge(&l, &other).is_none());

        // Out of order: no merge.
        assert!(Segment::try_merge(&r, &l).is_none());
    }

    #[test]
    fn test_merge_skips_flushing() {
        let whole = Segment::Memory(MemSegment::from_slice(b"abcdef"));
        let (l, mut r) = whole.split(3);
        if let Segment::Memory(m) = &mut r {
            m.flushing = true;
        }
        assert!(Segment::try_merge(&l, &r).is_none());
    }

    #[test]
    fn test_memory_size() {
        let seg = Segment::Memory(MemSegment::from_slice(b"12345"));
        assert_eq!(seg.memory_size(), 5 + ACCOUNTING_OVERHEAD);
        let stored = Segment::Stored(StoredSegment {
            locator: "3858f62230ac3c915f300c664312c63f+6".to_string(),
            size: 6,
            offset: 0,
            length: 6,
        });
        assert_eq!(stored.memory_size(), 34 + ACCOUNTING_OVERHEAD);
    }
}
