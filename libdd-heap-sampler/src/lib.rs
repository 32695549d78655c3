// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Statistical sampling of heap allocations.
//!
//! [`AllocationSampler`] picks roughly one allocation per configured number of
//! bytes, following a Poisson process so the choice is unbiased, and fans the
//! sampled addresses out to registered [`SamplesObserver`]s. Sampled addresses
//! are tracked in a [`LockFreeAddressHashSet`] so the free path can reject
//! unsampled addresses without taking a lock. [`SamplingAllocator`] wires the
//! sampler into `#[global_allocator]`.
//!
//! The record paths are safe to call from inside an allocator: the fast path
//! touches only thread-local state, and the slow path mutes its own
//! allocations so observer fanout cannot recurse into sampling.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod address_set;
mod sampler;
mod shim;

pub use address_set::LockFreeAddressHashSet;
pub use sampler::{
    AllocationSampler, AllocatorType, SamplesObserver, ScopedMuteHookedSamples,
    ScopedMuteThreadSamples, ScopedSuppressRandomness,
};
pub use shim::SamplingAllocator;
