//! Address allocators
//!
//! Allocators hand out byte offsets into a range they do not own; the caller
//! binds those offsets to a buffer. A failed allocation returns
//! [`INVALID_ADDRESS`] rather than an error, since running out of space is an
//! expected, retryable condition for streaming users.

mod general_purpose;
mod linear;

pub use general_purpose::GeneralPurposeAddressAllocator;
pub use linear::LinearAddressAllocator;

/// Returned by `alloc_addr` when no space is available
pub const INVALID_ADDRESS: u64 = u64::MAX;

pub trait AddressAllocator: Send {
    /// Reserve `bytes` at an offset aligned to `alignment`
    fn alloc_addr(&mut self, bytes: u64, alignment: u64) -> u64;

    /// Return a range previously obtained from `alloc_addr`
    fn free_addr(&mut self, addr: u64, bytes: u64);

    /// Forget every allocation
    fn reset(&mut self);

    /// Largest allocation guaranteed to succeed at `max_alignment()`
    fn max_size(&self) -> u64;

    fn max_alignment(&self) -> u64;

    /// Size the managed range could shrink to without moving allocations
    fn safe_shrink_size(&self) -> u64;

    /// Total managed bytes
    fn total_size(&self) -> u64;
}
