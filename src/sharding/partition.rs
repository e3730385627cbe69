/// Index of a partition, `0..number_of_partitions`.
pub type PartitionId = u32;

/// Stable 64-bit hash of a partition key.
///
/// FNV-1a, so every node computes the same partition for an identity
/// regardless of toolchain or process.
pub fn hash_partition_key(key: impl AsRef<[u8]>) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    key.as_ref().iter().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
    })
}

/// Partition owning the document with the given id string.
pub fn partition_for(id: &str, number_of_partitions: u32) -> PartitionId {
    (hash_partition_key(id) % u64::from(number_of_partitions.max(1))) as PartitionId
}
