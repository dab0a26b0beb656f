//! Deterministic percentage bucketing for rollout conditions.
//!
//! The bucket of a (seed, value) pair decides which end users fall into a
//! rollout cohort. Changing anything here reshuffles every live rollout.

use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

const BUCKET_RESOLUTION: u64 = 10_000;

/// Returns the bucket of `value` under `seed`, in `[0, 100)` with two decimals.
///
/// The value is appended to the seed as UTF-8 text, hashed with SHA-256, and
/// the first eight digest bytes (big-endian) are reduced modulo 10 000.
pub fn bucket(seed: &str, value: &str) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(value.as_bytes());
    let digest = hasher.finalize();

    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    let n = u64::from_be_bytes(head) % BUCKET_RESOLUTION;

    n as f64 / 100.0
}

/// Text form of a context value used for bucketing, if it can be bucketed.
pub fn bucket_input(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Whether `value` falls into `[from, to)` for `seed`.
pub fn in_segment(seed: &str, value: &JsonValue, from: f64, to: f64) -> bool {
    match bucket_input(value) {
        Some(input) => {
            let b = bucket(seed, &input);
            from <= b && b < to
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bucket_is_stable() {
        let first = bucket("rollout-1", "user-42");
        for _ in 0..10 {
            assert_eq!(bucket("rollout-1", "user-42"), first);
        }
        assert!((0.0..100.0).contains(&first));
    }

    #[test]
    fn test_bucket_depends_on_seed() {
        let differing = (0..50)
            .filter(|i| {
                let user = format!("user-{}", i);
                bucket("seed-a", &user) != bucket("seed-b", &user)
            })
            .count();
        assert!(differing > 40);
    }

    #[test]
    fn test_buckets_roughly_uniform() {
        let inside = (0..10_000)
            .filter(|i| bucket("uniform", &i.to_string()) < 25.0)
            .count();
        // 25% ± 2.5%
        assert!((2_250..=2_750).contains(&inside), "got {}", inside);
    }

    #[test]
    fn test_full_and_empty_ranges() {
        let value = json!("someone");
        assert!(in_segment("s", &value, 0.0, 100.0));
        assert!(!in_segment("s", &value, 50.0, 50.0));
    }

    #[test]
    fn test_numbers_bucket_like_their_text() {
        assert_eq!(
            in_segment("s", &json!(1234), 0.0, 50.0),
            in_segment("s", &json!("1234"), 0.0, 50.0)
        );
        assert!(!in_segment("s", &json!(null), 0.0, 100.0));
        assert!(!in_segment("s", &json!({"id": 1}), 0.0, 100.0));
    }
}
