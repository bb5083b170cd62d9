//! Sticky routing - maps a client address to a worker slot
//!
//! Uses a DJB2-style hash over the full address string, so the same client
//! lands on the same slot for a fixed concurrency regardless of process,
//! platform or restart.

use crate::types::{ClusterError, Result, WorkerSlot};

const HASH_SEED: u32 = 5381;

/// 32-bit DJB2 (xor variant) over the bytes of `value`, last byte first.
pub fn string_hash(value: &str) -> u32 {
    value
        .bytes()
        .rev()
        .fold(HASH_SEED, |hash, byte| hash.wrapping_mul(33) ^ u32::from(byte))
}

/// Slot that owns connections from `remote_address`.
///
/// `concurrency == 0` is a configuration error.
pub fn slot_for(remote_address: &str, concurrency: usize) -> Result<WorkerSlot> {
    if concurrency == 0 {
        return Err(ClusterError::Config(
            "cannot route with zero workers".to_string(),
        ));
    }
    let slot = u64::from(string_hash(remote_address)) % concurrency as u64;
    Ok(slot as WorkerSlot)
}
