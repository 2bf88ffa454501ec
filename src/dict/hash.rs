//! Hash functions used by the dictionary types.
//!
//! The seed is process-wide entropy, set once by the first
//! [`crate::server::Server::new`] in the process. Tables built before that
//! would hash differently afterwards, so it never changes again.

use std::sync::Once;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static HASH_SEED: AtomicU32 = AtomicU32::new(5381);

pub fn set_hash_function_seed(seed: u32) {
    HASH_SEED.store(seed, Ordering::Relaxed);
}

/// Seeds the hash from [`seed_from_entropy`] unless that already happened.
pub fn seed_once() {
    static SEEDED: Once = Once::new();
    SEEDED.call_once(|| set_hash_function_seed(seed_from_entropy()));
}

pub fn hash_function_seed() -> u32 {
    HASH_SEED.load(Ordering::Relaxed)
}

/// Derives a seed from the wall clock and the process id.
pub fn seed_from_entropy() -> u32 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let pid = std::process::id();
    (nanos as u32) ^ ((nanos >> 32) as u32) ^ pid.rotate_left(16)
}

/// MurmurHash2 over `data`, seeded with the process seed.
pub fn gen_hash(data: &[u8]) -> u32 {
    murmur2(data, hash_function_seed())
}

pub fn murmur2(data: &[u8], seed: u32) -> u32 {
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let mut h = seed ^ data.len() as u32;
    let mut chunks = data.chunks_exact(4);

    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);

        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() == 3 {
        h ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        h ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        h ^= tail[0] as u32;
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

/// Case-insensitive djb hash, used by the command table.
pub fn gen_case_hash(data: &[u8]) -> u32 {
    let mut hash = hash_function_seed();
    for &b in data {
        hash = (hash << 5)
            .wrapping_add(hash)
            .wrapping_add(b.to_ascii_lowercase() as u32);
    }
    hash
}
