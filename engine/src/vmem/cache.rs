//! LRU over recently translated pages, keyed by page-directory root and
//! 4 KiB chunk. Entries live until an explicit flush.

use hashbrown::HashMap;
use std::collections::VecDeque;

use super::translate::Translation;

const DEFAULT_CAPACITY: usize = 4096;

#[derive(Debug)]
pub struct TlbCache {
    map: HashMap<(u64, u64), Translation>,
    order: VecDeque<(u64, u64)>,
    capacity: usize,
    hits: u64,
    misses: u64,
}

impl Default for TlbCache {
    fn default() -> Self {
        TlbCache::with_capacity(DEFAULT_CAPACITY)
    }
}

impl TlbCache {
    pub fn with_capacity(capacity: usize) -> TlbCache {
        TlbCache {
            map: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
            hits: 0,
            misses: 0,
        }
    }

    fn key(pgd_root: u64, vaddr: u64) -> (u64, u64) {
        (pgd_root, vaddr >> 12)
    }

    /// A hit re-derives the exact physical address from the cached chunk.
    pub fn lookup(&mut self, pgd_root: u64, vaddr: u64) -> Option<Translation> {
        match self.map.get(&Self::key(pgd_root, vaddr)) {
            Some(t) => {
                self.hits += 1;
                Some(Translation {
                    paddr: t.paddr + (vaddr & 0xfff),
                    ..*t
                })
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, pgd_root: u64, vaddr: u64, t: Translation) {
        let key = Self::key(pgd_root, vaddr);
        if self.map.len() >= self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.map.remove(&old);
            }
        }
        // Store the chunk base so lookups at any offset within it match.
        let chunk = Translation {
            paddr: t.paddr & !0xfff,
            ..t
        };
        if self.map.insert(key, chunk).is_none() {
            self.order.push_back(key);
        }
    }

    pub fn flush(&mut self) {
        self.map.clear();
        self.order.clear();
    }

    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmem::translate::{PteFlags, PAGE_SIZE_4K};

    fn t(paddr: u64) -> Translation {
        Translation {
            paddr,
            page_size: PAGE_SIZE_4K,
            flags: PteFlags::PRESENT,
        }
    }

    #[test]
    fn hit_rederives_offset() {
        let mut c = TlbCache::with_capacity(4);
        c.insert(0x1000, 0xffff_8000_0000_1234, t(0x5234));
        let hit = c.lookup(0x1000, 0xffff_8000_0000_1ab0).unwrap();
        assert_eq!(hit.paddr, 0x5ab0);
        assert!(c.lookup(0x2000, 0xffff_8000_0000_1234).is_none(), "other root");
    }

    #[test]
    fn eviction_and_flush() {
        let mut c = TlbCache::with_capacity(2);
        c.insert(0, 0x1000, t(0x1000));
        c.insert(0, 0x2000, t(0x2000));
        c.insert(0, 0x3000, t(0x3000));
        assert!(c.lookup(0, 0x1000).is_none(), "evicted");
        assert!(c.lookup(0, 0x3000).is_some());
        c.flush();
        assert!(c.lookup(0, 0x3000).is_none());
    }
}
