// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::atomic::{
    AtomicU64,
    Ordering::{AcqRel, Acquire},
};

/// Advances `value` to `new` if (and only if) `new` is larger.
///
/// Loops until the store succeeds or a value `>= new` is observed.
/// Returns whether the value was mutated; the post-state is
/// `max(previous, new)` either way.
pub fn monotonic_update(value: &AtomicU64, new: u64) -> bool {
    let mut current = value.load(Acquire);

    loop {
        if current >= new {
            return false;
        }

        match value.compare_exchange_weak(current, new, AcqRel, Acquire) {
            Ok(_) => return true,
            Err(now) => current = now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn advances() {
        let v = AtomicU64::new(5);
        assert!(monotonic_update(&v, 10));
        assert_eq!(10, v.load(Acquire));
    }

    #[test]
    fn refuses_lower_and_equal() {
        let v = AtomicU64::new(10);
        assert!(!monotonic_update(&v, 10));
        assert!(!monotonic_update(&v, 3));
        assert_eq!(10, v.load(Acquire));
    }

    #[test]
    fn racing_updates_keep_max() {
        let v = std::sync::Arc::new(AtomicU64::new(0));

        std::thread::scope(|scope| {
            for offset in 0..4u64 {
                let v = v.clone();
                scope.spawn(move || {
                    for i in 0..1_000 {
                        monotonic_update(&v, i * 4 + offset);
                    }
                });
            }
        });

        assert_eq!(3_999, v.load(Acquire));
    }
}
