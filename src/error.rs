//! Error types for registry construction.
//!
//! Only constructors can fail with an error. Every hot-path outcome
//! (capacity exhaustion, duplicate keys, lost optimistic reads) is encoded
//! in a return value so latency stays predictable.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("capacity must be greater than zero")]
    ZeroCapacity,

    #[error("page length must be greater than zero")]
    ZeroPageLength,

    #[error("partition count must be greater than zero")]
    ZeroPartitions,

    #[error(
        "{partitions} partitions of {per_partition} slots do not fit the flat index space"
    )]
    IndexSpaceExhausted {
        partitions: usize,
        per_partition: usize,
    },
}
