#![deny(unsafe_op_in_unsafe_fn)]

// SPDX-FileCopyrightText: 2021 Guillaume DIDIER
//
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Bounded cooperative spin-wait, used while an armed interrupt is in flight.
//!
//! The two variants differ in the micro-architectural pressure they put on the
//! waiting core: `High` keeps an execution port busy with `rdrand`, which makes
//! the eventual interrupt land with a larger, more distinguishable cycle count;
//! `Low` just hints the spin loop.

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SpinKind {
    High,
    Low,
}

/// Polls `fired` up to `limit` times, spinning in between. Returns whether the
/// predicate turned true before the bound ran out.
pub fn spin_until(mut fired: impl FnMut() -> bool, kind: SpinKind, limit: u64) -> bool {
    let high = kind == SpinKind::High && is_x86_feature_detected!("rdrand");
    for _ in 0..limit {
        if fired() {
            return true;
        }
        if high {
            unsafe { rdrand_pressure() };
        } else {
            core::hint::spin_loop();
        }
    }
    fired()
}

#[target_feature(enable = "rdrand")]
unsafe fn rdrand_pressure() {
    let mut scratch = 0u64;
    let _ = unsafe { core::arch::x86_64::_rdrand64_step(&mut scratch) };
}

#[cfg(test)]
mod tests {
    use super::{spin_until, SpinKind};

    #[test]
    fn fires_immediately() {
        assert!(spin_until(|| true, SpinKind::Low, 0));
    }

    #[test]
    fn fires_after_a_few_polls() {
        let mut polls = 0;
        let fired = spin_until(
            || {
                polls += 1;
                polls >= 5
            },
            SpinKind::High,
            100,
        );
        assert!(fired);
        assert_eq!(polls, 5);
    }

    #[test]
    fn bounded_when_never_firing() {
        let mut polls = 0u64;
        let fired = spin_until(
            || {
                polls += 1;
                false
            },
            SpinKind::Low,
            50,
        );
        assert!(!fired);
        // limit polls plus the final check
        assert_eq!(polls, 51);
    }
}
