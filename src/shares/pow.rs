//! Proof-of-work verification seam.
//!
//! The pool never implements coin hash functions itself; it asks a
//! [`PowVerifier`] for the hash of a candidate and compares targets.
//! The built-in verifiers are SHA-2 based stand-ins wired at pool
//! construction; deployments swap in the real primitives there.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};

/// Narrow "hash this candidate" capability.
pub trait PowVerifier: Send + Sync {
    /// Hash a candidate header. `mix` carries the auxiliary proof for
    /// families that have one.
    fn hash(&self, header: &[u8], nonce: u64, mix: Option<&[u8]>) -> Result<[u8; 32]>;
}

/// Double SHA-256 over `header || nonce`, bitcoin-style byte order.
pub struct DoubleSha;

impl PowVerifier for DoubleSha {
    fn hash(&self, header: &[u8], _nonce: u64, _mix: Option<&[u8]>) -> Result<[u8; 32]> {
        // The nonce is already part of the serialized header here.
        let first = Sha256::digest(header);
        let second = Sha256::digest(first);
        let mut out: [u8; 32] = second.into();
        // Hashes compare against the target in reversed byte order.
        out.reverse();
        Ok(out)
    }
}

/// Seed-keyed verification context for memory-hard families.
///
/// One context exists per epoch; construction stands in for dataset
/// generation and is intentionally the only expensive step.
pub struct EpochContext {
    pub epoch: u64,
    seed: [u8; 32],
}

impl EpochContext {
    pub fn generate(epoch: u64, seed_hex: &str) -> Result<Self> {
        let bytes = hex::decode(seed_hex.trim_start_matches("0x"))
            .map_err(|e| anyhow!("bad seed hex: {}", e))?;
        if bytes.len() != 32 {
            return Err(anyhow!("seed must be 32 bytes, got {}", bytes.len()));
        }
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&bytes);
        Ok(Self { epoch, seed })
    }
}

impl PowVerifier for EpochContext {
    fn hash(&self, header: &[u8], nonce: u64, mix: Option<&[u8]>) -> Result<[u8; 32]> {
        let mut hasher = Sha256::new();
        hasher.update(self.seed);
        hasher.update(header);
        hasher.update(nonce.to_le_bytes());
        if let Some(mix) = mix {
            hasher.update(mix);
        }
        let first = hasher.finalize();
        let second = Sha256::digest(first);
        Ok(second.into())
    }
}

/// Immutable-per-epoch context cache.
///
/// The job manager populates the context for a new epoch before the first
/// job of that epoch is announced, so validation never generates on the
/// submission path.
pub struct EpochCache {
    epoch_length: u64,
    contexts: RwLock<HashMap<u64, Arc<EpochContext>>>,
}

impl EpochCache {
    pub fn new(epoch_length: u64) -> Self {
        Self {
            epoch_length: epoch_length.max(1),
            contexts: RwLock::new(HashMap::new()),
        }
    }

    pub fn epoch_of(&self, height: u64) -> u64 {
        height / self.epoch_length
    }

    /// Build (or reuse) the context for `height`. Old epochs are dropped
    /// once two newer ones exist.
    pub fn prepare(&self, height: u64, seed_hex: &str) -> Result<Arc<EpochContext>> {
        let epoch = self.epoch_of(height);
        if let Some(ctx) = self.contexts.read().get(&epoch) {
            return Ok(ctx.clone());
        }
        let ctx = Arc::new(EpochContext::generate(epoch, seed_hex)?);
        let mut contexts = self.contexts.write();
        let entry = contexts.entry(epoch).or_insert_with(|| ctx.clone()).clone();
        contexts.retain(|&e, _| e + 2 >= epoch);
        Ok(entry)
    }

    pub fn get(&self, height: u64) -> Option<Arc<EpochContext>> {
        self.contexts.read().get(&self.epoch_of(height)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: &str = "aa00000000000000000000000000000000000000000000000000000000000011";

    #[test]
    fn double_sha_is_deterministic() {
        let pow = DoubleSha;
        let a = pow.hash(b"header-bytes", 0, None).unwrap();
        let b = pow.hash(b"header-bytes", 0, None).unwrap();
        assert_eq!(a, b);
        let c = pow.hash(b"header-bytez", 0, None).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn epoch_context_mixes_nonce_and_seed() {
        let ctx = EpochContext::generate(0, SEED).unwrap();
        let a = ctx.hash(b"hdr", 1, None).unwrap();
        let b = ctx.hash(b"hdr", 2, None).unwrap();
        assert_ne!(a, b);

        let other_seed = "bb00000000000000000000000000000000000000000000000000000000000011";
        let ctx2 = EpochContext::generate(0, other_seed).unwrap();
        assert_ne!(a, ctx2.hash(b"hdr", 1, None).unwrap());
    }

    #[test]
    fn cache_reuses_context_within_epoch() {
        let cache = EpochCache::new(100);
        let a = cache.prepare(10, SEED).unwrap();
        let b = cache.prepare(99, SEED).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(cache.get(150).is_none());
    }

    #[test]
    fn cache_drops_stale_epochs() {
        let cache = EpochCache::new(10);
        cache.prepare(5, SEED).unwrap(); // epoch 0
        cache.prepare(15, SEED).unwrap(); // epoch 1
        cache.prepare(35, SEED).unwrap(); // epoch 3
        assert!(cache.get(5).is_none());
        assert!(cache.get(15).is_some());
        assert!(cache.get(35).is_some());
    }

    #[test]
    fn bad_seed_is_rejected() {
        assert!(EpochContext::generate(0, "xyz").is_err());
        assert!(EpochContext::generate(0, "aabb").is_err());
    }
}
