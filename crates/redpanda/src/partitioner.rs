//! Key-based partition routing.

/// FNV-1a hash of a key, stable across processes and builds.
pub fn key_hash(key: &str) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    key.bytes().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ byte as u64).wrapping_mul(PRIME)
    })
}

/// Maps a key onto one of `num_partitions` partitions.
pub fn partition_hash(key: &str, num_partitions: i32) -> i32 {
    if num_partitions <= 1 {
        return 0;
    }
    (key_hash(key) % num_partitions as u64) as i32
}
