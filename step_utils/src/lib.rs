#![allow(clippy::missing_safety_doc)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod pagetable;

use core::arch::x86_64 as arch_x86;

// rdtsc no fence
pub unsafe fn rdtsc_nofence() -> u64 {
    unsafe { arch_x86::_rdtsc() }
}
// rdtsc (has mfence before and after)
pub unsafe fn rdtsc_fence() -> u64 {
    unsafe {
        arch_x86::_mm_mfence();
        let tsc: u64 = arch_x86::_rdtsc();
        arch_x86::_mm_mfence();
        tsc
    }
}

/// Cycle delta between two monotonic counter samples taken on the same
/// logical core. Wraparound-safe; only meaningful as a relative quantity.
pub fn elapsed_cycles(begin: u64, end: u64) -> u64 {
    end.wrapping_sub(begin)
}

#[cfg(test)]
mod tests {
    use super::elapsed_cycles;

    #[test]
    fn elapsed_simple() {
        assert_eq!(elapsed_cycles(100, 1100), 1000);
        assert_eq!(elapsed_cycles(42, 42), 0);
    }

    #[test]
    fn elapsed_wraparound() {
        assert_eq!(elapsed_cycles(u64::MAX - 9, 10), 20);
    }
}
