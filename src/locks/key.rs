//! Lock key derivation
//!
//! Advisory locks are keyed by a signed 64-bit integer. Human-readable lock
//! names are hashed with 64-bit FNV-1a and the unsigned result reinterpreted
//! as `i64`, so the same name maps to the same key in every process.

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Map a lock name to its advisory lock key.
///
/// ```
/// use dbcoord::locks::generate_lock_key;
///
/// assert_eq!(generate_lock_key("cron:nightly-export"), generate_lock_key("cron:nightly-export"));
/// assert_ne!(generate_lock_key("cron:a"), generate_lock_key("cron:b"));
/// ```
pub fn generate_lock_key(name: &str) -> i64 {
    let hash = name.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    });
    hash as i64
}

/// Split a key into the `(classid, objid)` halves PostgreSQL reports in `pg_locks`
pub(crate) fn split_key(key: i64) -> (u32, u32) {
    let bits = key as u64;
    ((bits >> 32) as u32, bits as u32)
}
