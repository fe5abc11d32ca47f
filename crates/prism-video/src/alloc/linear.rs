use crate::align_up;

use super::{AddressAllocator, INVALID_ADDRESS};

/// Bump allocator; space only comes back through `reset`
#[derive(Debug, Clone)]
pub struct LinearAddressAllocator {
    size: u64,
    max_alignment: u64,
    cursor: u64,
}

impl LinearAddressAllocator {
    pub fn new(size: u64, max_alignment: u64) -> Self {
        Self {
            size,
            max_alignment: max_alignment.max(1),
            cursor: 0,
        }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }
}

impl AddressAllocator for LinearAddressAllocator {
    fn alloc_addr(&mut self, bytes: u64, alignment: u64) -> u64 {
        if bytes == 0 {
            return INVALID_ADDRESS;
        }
        let start = align_up(self.cursor, alignment);
        match start.checked_add(bytes) {
            Some(end) if end <= self.size => {
                self.cursor = end;
                start
            }
            _ => INVALID_ADDRESS,
        }
    }

    fn free_addr(&mut self, _addr: u64, _bytes: u64) {}

    fn reset(&mut self) {
        self.cursor = 0;
    }

    fn max_size(&self) -> u64 {
        let start = align_up(self.cursor, self.max_alignment);
        self.size.saturating_sub(start)
    }

    fn max_alignment(&self) -> u64 {
        self.max_alignment
    }

    fn safe_shrink_size(&self) -> u64 {
        self.cursor
    }

    fn total_size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_and_reset() {
        let mut alloc = LinearAddressAllocator::new(1024, 256);

        assert_eq!(alloc.alloc_addr(10, 4), 0);
        assert_eq!(alloc.alloc_addr(10, 256), 256);
        assert_eq!(alloc.cursor(), 266);
        assert_eq!(alloc.max_size(), 512);

        alloc.free_addr(0, 10);
        assert_eq!(alloc.cursor(), 266);

        alloc.reset();
        assert_eq!(alloc.max_size(), 1024);
    }

    #[test]
    fn test_rejects_zero_and_overflowing_requests() {
        let mut alloc = LinearAddressAllocator::new(64, 4);

        assert_eq!(alloc.alloc_addr(0, 4), INVALID_ADDRESS);
        assert_eq!(alloc.alloc_addr(65, 4), INVALID_ADDRESS);
        assert_eq!(alloc.alloc_addr(u64::MAX, 1), INVALID_ADDRESS);
        assert_eq!(alloc.alloc_addr(64, 4), 0);
        assert_eq!(alloc.alloc_addr(1, 1), INVALID_ADDRESS);
    }
}
