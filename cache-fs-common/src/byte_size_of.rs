//! A trait for querying the in-memory footprint of a value, including any
//! heap allocations it owns. The index's own slot-cost accounting is a
//! fixed-size budget (every key and range element has a compile-time-known
//! footprint, so it charges a constant per slot rather than measuring one),
//! but the trait itself is kept available for any value whose footprint
//! isn't known until runtime.

use std::mem;

/// Returns the size, in bytes, that a value occupies in memory, including
/// heap-allocated data it owns but excluding shared/borrowed data.
pub trait ByteSizeOf {
    /// The stack size of `Self`, as known at compile time.
    fn allocated_bytes(&self) -> usize;

    /// Total size: `size_of::<Self>()` plus any heap allocations owned by
    /// this value.
    fn size_of(&self) -> usize {
        mem::size_of_val(self) + self.allocated_bytes()
    }
}

impl ByteSizeOf for [u8; 16] {
    fn allocated_bytes(&self) -> usize {
        0
    }
}

impl<T: ByteSizeOf> ByteSizeOf for Vec<T> {
    fn allocated_bytes(&self) -> usize {
        self.capacity() * mem::size_of::<T>()
            + self.iter().map(ByteSizeOf::allocated_bytes).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_of_u8_has_no_heap_allocation() {
        let key = [0u8; 16];
        assert_eq!(key.allocated_bytes(), 0);
        assert_eq!(key.size_of(), mem::size_of::<[u8; 16]>());
    }

    #[test]
    fn vec_accounts_for_capacity_not_just_len() {
        let mut v: Vec<[u8; 16]> = Vec::with_capacity(4);
        v.push([1u8; 16]);
        assert_eq!(v.len(), 1);
        assert_eq!(v.allocated_bytes(), 4 * mem::size_of::<[u8; 16]>());
        assert_eq!(
            v.size_of(),
            mem::size_of::<Vec<[u8; 16]>>() + 4 * mem::size_of::<[u8; 16]>()
        );
    }
}
