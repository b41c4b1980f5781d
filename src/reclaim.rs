//! Pin-based safe memory reclamation.
//!
//! Structures built on this module never free a shared node synchronously.
//! A thread checks out a pin set ([`Pins`]) before participating, publishes
//! the address of every node it is about to dereference into one of its pin
//! slots, and clears the slot when done. Logically-removed nodes go to the
//! removing thread's purgatory; once purgatory crosses a threshold, the
//! thread scans every other thread's published pins and physically recycles
//! only the entries no pin matches. This is a coarse, threshold-triggered
//! grace-period scheme: peak extra memory is bounded by
//! (threshold × active threads) in exchange for a read path with zero
//! synchronization beyond the pin stores themselves.
//!
//! Recycled nodes never return to the global allocator while the owning
//! structure is alive: they are scrubbed and pushed onto a type-stable free
//! stack ([`Reclaimer`]) that subsequent allocations pop. That keeps the
//! revalidate-after-pin dance of the traversal protocol defined behavior
//! even when a thread races with a free: the worst a stale pointer can
//! observe is the link word of a recycled node, which the validation step
//! then rejects.

mod alloc;
mod pin;

pub(crate) use alloc::{Pins, Reclaimable, Reclaimer};
