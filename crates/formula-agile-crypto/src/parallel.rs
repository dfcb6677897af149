//! Parallel segment decryption (feature `parallel`).
//!
//! Segments carry independent IVs, so they can be decrypted in any order. Results land in place,
//! which keeps the output in segment order regardless of scheduling.

use std::sync::OnceLock;

use rayon::prelude::*;
use rayon::ThreadPool;

use crate::package::{decrypt_segment_in_place, SEGMENT_LENGTH};
use crate::{AgileError, HashAlgorithm};

/// Crate-local pool. Global pool initialization can fail under tight thread limits and Rayon
/// panics on first use in that case; a local pool lets us fall back to sequential decryption.
static RAYON_POOL: OnceLock<Option<ThreadPool>> = OnceLock::new();

fn desired_rayon_threads() -> usize {
    let from_env = std::env::var("RAYON_NUM_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|&n| n > 0);
    from_env.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    })
}

fn build_rayon_pool() -> Option<ThreadPool> {
    let requested = desired_rayon_threads().max(1);
    let try_build = |n| rayon::ThreadPoolBuilder::new().num_threads(n).build();

    match try_build(requested) {
        Ok(pool) => Some(pool),
        Err(_) if requested > 1 => try_build(1).ok(),
        Err(_) => None,
    }
}

fn rayon_pool() -> Option<&'static ThreadPool> {
    RAYON_POOL.get_or_init(build_rayon_pool).as_ref()
}

/// Decrypt every 4096-byte segment of `buf` in place, using the pool when one is available.
pub(crate) fn decrypt_segments_in_place(
    secret_key: &[u8],
    salt: &[u8],
    hash_alg: HashAlgorithm,
    buf: &mut [u8],
) -> Result<(), AgileError> {
    let decrypt = |(index, segment): (usize, &mut [u8])| {
        decrypt_segment_in_place(secret_key, salt, hash_alg, index as u32, segment)
    };

    match rayon_pool() {
        Some(pool) => {
            log::trace!(
                "decrypting {} EncryptedPackage segments on {} threads",
                buf.len().div_ceil(SEGMENT_LENGTH),
                pool.current_num_threads()
            );
            pool.install(|| {
                buf.par_chunks_mut(SEGMENT_LENGTH)
                    .enumerate()
                    .try_for_each(decrypt)
            })
        }
        None => {
            log::debug!("rayon pool unavailable; decrypting EncryptedPackage sequentially");
            buf.chunks_mut(SEGMENT_LENGTH).enumerate().try_for_each(decrypt)
        }
    }
}
