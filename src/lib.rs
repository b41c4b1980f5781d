#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

//! A fast and concurrent object registry for live server instrumentation.
//!
//! `vitals` is the object-registry layer that sits beneath a server's
//! instrumentation subsystem. Worker threads create, look up, iterate and
//! destroy small fixed-size records representing live engine objects, with no
//! blocking on the hot path and with the guarantee that no thread ever
//! dereferences memory that has been recycled to a different logical object.
//!
//! The crate provides four building blocks, leaves first:
//!
//! - [`lock::VersionedLock`]: a per-record word packing a monotonically
//!   increasing version and a FREE/DIRTY/ALLOCATED state, with seqlock-style
//!   optimistic reads.
//! - [`pool::Pool`] and [`pool::PartitionedPool`]: bounded, lazily growing
//!   slab pools of versioned slots. Allocation scans materialized pages with
//!   a monotonic counter and claims slots with a single CAS; capacity
//!   exhaustion is reported through a saturating lost counter, never an
//!   error.
//! - [`index::HashIndex`]: a lock-free extensible hash (a split-ordered
//!   list) for keyed lookup of caller payloads, with pin-protected traversal
//!   and deferred, batched node reclamation.
//! - [`index::Pins`]: a checked-out set of published pins plus the owning
//!   thread's purgatory of logically-removed nodes awaiting a grace period.
//!
//! Registries are explicit instances: embedders compose the pools and
//! indexes they need into their own subsystem context. The crate defines no
//! global state, so independent instances can coexist (and be tested)
//! freely.
//!
//! # Example
//!
//! ```
//! use vitals::pool::Pool;
//!
//! #[derive(Clone, Copy, Default)]
//! struct SessionStats {
//!     bytes_sent: u64,
//!     queries: u64,
//! }
//!
//! let pool: Pool<SessionStats> = Pool::new(1024).unwrap();
//!
//! // A worker claims a slot, fills it, then publishes it to readers.
//! let writer = pool.allocate().unwrap();
//! let slot = writer.publish();
//!
//! // The owner updates in place; concurrent readers snapshot optimistically.
//! slot.modify(|s| s.queries += 1);
//! assert_eq!(slot.read().unwrap().queries, 1);
//!
//! pool.deallocate(slot);
//! ```

pub mod error;
pub(crate) mod grow_array;
pub mod index;
pub mod lock;
pub mod pool;
pub(crate) mod reclaim;

pub use error::ConfigError;
