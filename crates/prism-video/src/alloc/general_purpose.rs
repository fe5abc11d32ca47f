use crate::align_up;

use super::{AddressAllocator, INVALID_ADDRESS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeRange {
    offset: u64,
    size: u64,
}

impl FreeRange {
    fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// First-fit allocator over an offset-ordered free list
///
/// Freed ranges are merged with their neighbours immediately, so the free
/// list never holds two adjacent ranges.
#[derive(Debug, Clone)]
pub struct GeneralPurposeAddressAllocator {
    size: u64,
    max_alignment: u64,
    free: Vec<FreeRange>,
}

impl GeneralPurposeAddressAllocator {
    pub fn new(size: u64, max_alignment: u64) -> Self {
        let mut alloc = Self {
            size,
            max_alignment: max_alignment.max(1),
            free: Vec::new(),
        };
        alloc.reset();
        alloc
    }

    /// Total free bytes, ignoring fragmentation
    pub fn free_size(&self) -> u64 {
        self.free.iter().map(|r| r.size).sum()
    }

    pub fn free_range_count(&self) -> usize {
        self.free.len()
    }
}

impl AddressAllocator for GeneralPurposeAddressAllocator {
    fn alloc_addr(&mut self, bytes: u64, alignment: u64) -> u64 {
        if bytes == 0 {
            return INVALID_ADDRESS;
        }
        let alignment = alignment.max(1);

        for i in 0..self.free.len() {
            let range = self.free[i];
            let start = align_up(range.offset, alignment);
            let Some(end) = start.checked_add(bytes) else {
                return INVALID_ADDRESS;
            };
            if end > range.end() {
                continue;
            }

            let head = FreeRange {
                offset: range.offset,
                size: start - range.offset,
            };
            let tail = FreeRange {
                offset: end,
                size: range.end() - end,
            };
            match (head.size > 0, tail.size > 0) {
                (true, true) => {
                    self.free[i] = head;
                    self.free.insert(i + 1, tail);
                }
                (true, false) => self.free[i] = head,
                (false, true) => self.free[i] = tail,
                (false, false) => {
                    self.free.remove(i);
                }
            }
            return start;
        }

        INVALID_ADDRESS
    }

    fn free_addr(&mut self, addr: u64, bytes: u64) {
        if addr == INVALID_ADDRESS || bytes == 0 {
            return;
        }
        let mut range = FreeRange {
            offset: addr,
            size: bytes,
        };
        let index = self.free.partition_point(|r| r.offset < addr);

        let merges_next = self
            .free
            .get(index)
            .is_some_and(|next| range.end() == next.offset);
        if merges_next {
            range.size += self.free.remove(index).size;
        }

        let merges_prev = index > 0 && self.free[index - 1].end() == range.offset;
        if merges_prev {
            self.free[index - 1].size += range.size;
        } else {
            self.free.insert(index, range);
        }
    }

    fn reset(&mut self) {
        self.free.clear();
        if self.size > 0 {
            self.free.push(FreeRange {
                offset: 0,
                size: self.size,
            });
        }
    }

    fn max_size(&self) -> u64 {
        self.free
            .iter()
            .map(|r| r.end().saturating_sub(align_up(r.offset, self.max_alignment)))
            .max()
            .unwrap_or(0)
    }

    fn max_alignment(&self) -> u64 {
        self.max_alignment
    }

    fn safe_shrink_size(&self) -> u64 {
        match self.free.last() {
            Some(last) if last.end() == self.size => last.offset,
            _ => self.size,
        }
    }

    fn total_size(&self) -> u64 {
        self.size
    }
}
