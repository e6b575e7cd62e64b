//! Deterministic hashing for `H` schedule fields and fresh draws for `R`.
//!
//! `H` values must be reproducible across daemon restarts so that a job's
//! hashed minute/hour/etc. never moves. They are derived from a SHA-256 of
//! the job name and a per-field tag. `R` values are redrawn on every
//! schedule evaluation.

use rand::Rng;
use sha2::{Digest, Sha256};

/// Stable 64-bit hash of `(job_name, field_tag)`.
pub fn stable_hash(job_name: &str, field_tag: &str) -> u64 {
    let digest = Sha256::digest(format!("{job_name}\n{field_tag}").as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Map the stable hash into the inclusive range `[lo, hi]`.
pub fn hash_in(job_name: &str, field_tag: &str, lo: u32, hi: u32) -> u32 {
    let span = u64::from(hi - lo + 1);
    lo + (stable_hash(job_name, field_tag) % span) as u32
}

/// A fresh uniform draw from the inclusive range `[lo, hi]`.
pub fn random_in(lo: u32, hi: u32) -> u32 {
    rand::thread_rng().gen_range(lo..=hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_hash_is_deterministic() {
        assert_eq!(stable_hash("backup", "minute"), stable_hash("backup", "minute"));
    }

    #[test]
    fn stable_hash_varies_by_name_and_tag() {
        assert_ne!(stable_hash("backup", "minute"), stable_hash("deploy", "minute"));
        assert_ne!(stable_hash("backup", "minute"), stable_hash("backup", "hour"));
    }

    #[test]
    fn hash_in_respects_bounds() {
        for name in ["a", "b", "some-long-job.name"] {
            let v = hash_in(name, "minute", 0, 59);
            assert!(v <= 59);
            let v = hash_in(name, "dom", 1, 28);
            assert!((1..=28).contains(&v));
        }
    }

    #[test]
    fn random_in_respects_bounds() {
        for _ in 0..100 {
            let v = random_in(10, 20);
            assert!((10..=20).contains(&v));
        }
    }
}
