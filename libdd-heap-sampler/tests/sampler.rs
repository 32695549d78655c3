// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests against the process-wide sampler singleton.
//!
//! Every test that touches the singleton runs inside a [`SamplerScope`],
//! which serializes the tests on one lock, makes intervals deterministic and
//! restores the sampling interval on exit. Observer registrations are held
//! in RAII wrappers so a failing assertion cannot leave the sampler running
//! for the next test. Sampled addresses are process state too, so each test
//! works in its own address range.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use libdd_heap_sampler::{
    AllocationSampler, AllocatorType, SamplesObserver, ScopedMuteThreadSamples,
    ScopedSuppressRandomness,
};
use parking_lot::{Mutex, MutexGuard};

static TEST_GUARD: Mutex<()> = Mutex::new(());

struct SamplerScope {
    previous_interval: usize,
    _suppress: ScopedSuppressRandomness,
    _serial: MutexGuard<'static, ()>,
}

impl SamplerScope {
    fn new(interval: usize) -> Self {
        let serial = TEST_GUARD.lock();
        let suppress = ScopedSuppressRandomness::new();
        let sampler = AllocationSampler::get();
        let previous_interval = sampler.sampling_interval();
        sampler.set_sampling_interval(interval);
        Self {
            previous_interval,
            _suppress: suppress,
            _serial: serial,
        }
    }
}

impl Drop for SamplerScope {
    // Fields drop afterwards in declaration order, so the interval is
    // restored first and the serializing lock is released last.
    fn drop(&mut self) {
        AllocationSampler::get().set_sampling_interval(self.previous_interval);
    }
}

struct ObserverRegistration {
    observer: Arc<dyn SamplesObserver>,
}

impl ObserverRegistration {
    fn new(observer: Arc<dyn SamplesObserver>) -> Self {
        AllocationSampler::get().add_samples_observer(observer.clone());
        Self { observer }
    }
}

impl Drop for ObserverRegistration {
    fn drop(&mut self) {
        AllocationSampler::get().remove_samples_observer(&self.observer);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AddedSample {
    address: usize,
    size: usize,
    total_allocated: usize,
    allocator_type: AllocatorType,
    context: Option<&'static str>,
}

#[derive(Default)]
struct CollectingObserver {
    added: Mutex<Vec<AddedSample>>,
    removed: Mutex<Vec<usize>>,
}

impl CollectingObserver {
    fn added(&self) -> Vec<AddedSample> {
        self.added.lock().clone()
    }

    fn removed(&self) -> Vec<usize> {
        self.removed.lock().clone()
    }
}

impl SamplesObserver for CollectingObserver {
    fn sample_added(
        &self,
        address: usize,
        size: usize,
        total_allocated: usize,
        allocator_type: AllocatorType,
        context: Option<&'static str>,
    ) {
        self.added.lock().push(AddedSample {
            address,
            size,
            total_allocated,
            allocator_type,
            context,
        });
    }

    fn sample_removed(&self, address: usize) {
        self.removed.lock().push(address);
    }
}

#[test]
fn one_large_allocation_reports_every_crossing_at_once() {
    let _scope = SamplerScope::new(1024);
    let observer = Arc::new(CollectingObserver::default());
    let _registration = ObserverRegistration::new(observer.clone());
    let sampler = AllocationSampler::get();

    // 10_000 bytes: the first-allocation draw consumes 1024, the remaining
    // 8976 cross eight more times plus the final draw, nine in total.
    sampler.record_alloc(0x10_000, 10_000, AllocatorType::Manual, Some("request-parser"));

    let added = observer.added();
    assert_eq!(
        added,
        vec![AddedSample {
            address: 0x10_000,
            size: 10_000,
            total_allocated: 9 * 1024,
            allocator_type: AllocatorType::Manual,
            context: Some("request-parser"),
        }]
    );
    sampler.record_free(0x10_000);
}

#[test]
fn small_allocations_accumulate_until_the_interval_is_crossed() {
    let _scope = SamplerScope::new(4096);
    let observer = Arc::new(CollectingObserver::default());
    let _registration = ObserverRegistration::new(observer.clone());
    let sampler = AllocationSampler::get();

    for i in 0..5 {
        sampler.record_alloc(0x20_000 + i * 8, 1000, AllocatorType::Manual, None);
    }

    // 5000 bytes accumulated against a 4096-byte interval: exactly one
    // sample, attributed to the allocation that crossed.
    let added = observer.added();
    assert_eq!(added.len(), 1);
    assert_eq!(added[0].address, 0x20_000 + 4 * 8);
    assert_eq!(added[0].size, 1000);
    assert_eq!(added[0].total_allocated, 4096);
    sampler.record_free(added[0].address);
}

#[test]
fn freeing_a_sampled_address_notifies_once() {
    let _scope = SamplerScope::new(1024);
    let observer = Arc::new(CollectingObserver::default());
    let _registration = ObserverRegistration::new(observer.clone());
    let sampler = AllocationSampler::get();

    sampler.record_alloc(0x30_000, 8192, AllocatorType::Manual, None);
    assert_eq!(observer.added().len(), 1);

    sampler.record_free(0x30_000);
    assert_eq!(observer.removed(), vec![0x30_000]);

    // Already forgotten; a second free of the same address is a no-op.
    sampler.record_free(0x30_000);
    assert_eq!(observer.removed(), vec![0x30_000]);
}

#[test]
fn freeing_an_address_that_was_never_sampled_is_silent() {
    let _scope = SamplerScope::new(1024);
    let observer = Arc::new(CollectingObserver::default());
    let _registration = ObserverRegistration::new(observer.clone());

    AllocationSampler::get().record_free(0x40_000);
    assert!(observer.removed().is_empty());
}

#[test]
fn resampling_a_live_address_keeps_the_first_sample() {
    let _scope = SamplerScope::new(1024);
    let observer = Arc::new(CollectingObserver::default());
    let _registration = ObserverRegistration::new(observer.clone());
    let sampler = AllocationSampler::get();

    sampler.record_alloc(0x50_000, 8192, AllocatorType::Manual, None);
    assert_eq!(observer.added().len(), 1);

    // The same address crosses again without an intervening free. The
    // crossing is consumed but no second sample is stored or reported.
    sampler.record_alloc(0x50_000, 8192, AllocatorType::Manual, None);
    assert_eq!(observer.added().len(), 1);

    sampler.record_free(0x50_000);
    assert_eq!(observer.removed(), vec![0x50_000]);
}

#[test]
fn failed_allocations_are_never_sampled() {
    let _scope = SamplerScope::new(1024);
    let observer = Arc::new(CollectingObserver::default());
    let _registration = ObserverRegistration::new(observer.clone());

    AllocationSampler::get().record_alloc(0, 1 << 20, AllocatorType::Manual, None);
    assert!(observer.added().is_empty());
}

#[test]
fn stopped_sampler_resets_thread_state_on_every_call() {
    let _scope = SamplerScope::new(4096);
    let sampler = AllocationSampler::get();

    // No observers: these huge allocations must leave no residue behind.
    for i in 0..3 {
        sampler.record_alloc(0x60_000 + i * 8, 1 << 20, AllocatorType::Manual, None);
    }

    let observer = Arc::new(CollectingObserver::default());
    let _registration = ObserverRegistration::new(observer.clone());

    // The thread starts from scratch: the first allocation only seeds the
    // interval, and the fifth is the one that crosses.
    for i in 0..5 {
        sampler.record_alloc(0x61_000 + i * 8, 1000, AllocatorType::Manual, None);
        let expected = if i < 4 { 0 } else { 1 };
        assert_eq!(observer.added().len(), expected, "after allocation {i}");
    }
    assert_eq!(observer.added()[0].total_allocated, 4096);
    sampler.record_free(0x61_000 + 4 * 8);
}

#[test]
fn bytes_allocated_while_muted_still_count_after_unmuting() {
    let _scope = SamplerScope::new(4096);
    let observer = Arc::new(CollectingObserver::default());
    let _registration = ObserverRegistration::new(observer.clone());
    let sampler = AllocationSampler::get();

    {
        let _mute = ScopedMuteThreadSamples::new();
        sampler.record_alloc(0x70_000, 100_000, AllocatorType::Manual, None);
    }
    assert!(observer.added().is_empty());

    // The muted 100_000 bytes stayed in the accumulator, so this one-byte
    // allocation settles the whole backlog: a draw of 4096 leaves 95_905,
    // which is 23 full intervals plus one final draw.
    sampler.record_alloc(0x70_008, 1, AllocatorType::Manual, None);
    let added = observer.added();
    assert_eq!(added.len(), 1);
    assert_eq!(added[0].address, 0x70_008);
    assert_eq!(added[0].size, 1);
    assert_eq!(added[0].total_allocated, 24 * 4096);
    sampler.record_free(0x70_008);
}

#[test]
fn every_observer_sees_every_sample() {
    let _scope = SamplerScope::new(1024);
    let first = Arc::new(CollectingObserver::default());
    let second = Arc::new(CollectingObserver::default());
    let _first_registration = ObserverRegistration::new(first.clone());
    let sampler = AllocationSampler::get();

    sampler.record_alloc(0x80_000, 8192, AllocatorType::External, None);
    {
        let _second_registration = ObserverRegistration::new(second.clone());
        sampler.record_alloc(0x80_008, 8192, AllocatorType::External, None);
    }
    sampler.record_alloc(0x80_010, 8192, AllocatorType::External, None);

    assert_eq!(first.added().len(), 3);
    assert_eq!(first.added()[0].allocator_type, AllocatorType::External);
    // The second observer was only registered for the middle allocation.
    assert_eq!(second.added().len(), 1);
    assert_eq!(second.added()[0].address, 0x80_008);

    for offset in [0x0, 0x8, 0x10] {
        sampler.record_free(0x80_000 + offset);
    }
    assert_eq!(first.removed().len(), 3);
}

#[test]
fn adding_the_same_observer_twice_panics() {
    let _scope = SamplerScope::new(1024);
    let observer = Arc::new(CollectingObserver::default());
    let _registration = ObserverRegistration::new(observer.clone());

    let observer: Arc<dyn SamplesObserver> = observer;
    let result = catch_unwind(AssertUnwindSafe(|| {
        AllocationSampler::get().add_samples_observer(observer.clone());
    }));
    assert!(result.is_err());
}

#[test]
fn removing_an_observer_that_was_never_added_panics() {
    let _scope = SamplerScope::new(1024);
    let observer: Arc<dyn SamplesObserver> = Arc::new(CollectingObserver::default());

    let result = catch_unwind(AssertUnwindSafe(|| {
        AllocationSampler::get().remove_samples_observer(&observer);
    }));
    assert!(result.is_err());
}

#[test]
fn setting_a_zero_interval_panics() {
    let _scope = SamplerScope::new(1024);

    let result = catch_unwind(|| AllocationSampler::get().set_sampling_interval(0));
    assert!(result.is_err());
    assert_eq!(AllocationSampler::get().sampling_interval(), 1024);
}

#[test]
fn interval_updates_are_visible_to_the_getter() {
    let _scope = SamplerScope::new(1024);
    let sampler = AllocationSampler::get();

    sampler.set_sampling_interval(8192);
    assert_eq!(sampler.sampling_interval(), 8192);
}

/// Forwards every sample to a registration of a second observer. Exercises
/// calling back into the sampler from inside an observer callback.
struct RegisteringObserver {
    inner: Arc<CollectingObserver>,
    late: Arc<CollectingObserver>,
    registered_late: AtomicBool,
}

impl SamplesObserver for RegisteringObserver {
    fn sample_added(
        &self,
        address: usize,
        size: usize,
        total_allocated: usize,
        allocator_type: AllocatorType,
        context: Option<&'static str>,
    ) {
        self.inner
            .sample_added(address, size, total_allocated, allocator_type, context);
        if !self.registered_late.swap(true, Ordering::Relaxed) {
            AllocationSampler::get().add_samples_observer(self.late.clone());
        }
    }

    fn sample_removed(&self, address: usize) {
        self.inner.sample_removed(address);
    }
}

#[test]
fn observers_may_register_observers_from_their_callbacks() {
    let _scope = SamplerScope::new(1024);
    let late = Arc::new(CollectingObserver::default());
    let observer = Arc::new(RegisteringObserver {
        inner: Arc::new(CollectingObserver::default()),
        late: late.clone(),
        registered_late: AtomicBool::new(false),
    });
    let _registration = ObserverRegistration::new(observer.clone());
    let sampler = AllocationSampler::get();

    sampler.record_alloc(0x90_000, 8192, AllocatorType::Manual, None);
    // The late observer was registered mid-fanout and must not see the
    // sample that triggered its registration.
    assert_eq!(observer.inner.added().len(), 1);
    assert!(late.added().is_empty());

    sampler.record_alloc(0x90_008, 8192, AllocatorType::Manual, None);
    assert_eq!(observer.inner.added().len(), 2);
    assert_eq!(late.added().len(), 1);

    let late: Arc<dyn SamplesObserver> = late;
    sampler.remove_samples_observer(&late);
    sampler.record_free(0x90_000);
    sampler.record_free(0x90_008);
}

/// Unregisters itself when it sees its first sample.
struct SelfRemovingObserver {
    inner: Arc<CollectingObserver>,
    this: Mutex<Option<Arc<dyn SamplesObserver>>>,
}

impl SamplesObserver for SelfRemovingObserver {
    fn sample_added(
        &self,
        address: usize,
        size: usize,
        total_allocated: usize,
        allocator_type: AllocatorType,
        context: Option<&'static str>,
    ) {
        self.inner
            .sample_added(address, size, total_allocated, allocator_type, context);
        if let Some(this) = self.this.lock().take() {
            AllocationSampler::get().remove_samples_observer(&this);
        }
    }

    fn sample_removed(&self, address: usize) {
        self.inner.sample_removed(address);
    }
}

#[test]
fn observers_may_unregister_themselves_from_their_callbacks() {
    let _scope = SamplerScope::new(1024);
    let observer = Arc::new(SelfRemovingObserver {
        inner: Arc::new(CollectingObserver::default()),
        this: Mutex::new(None),
    });
    let as_dyn: Arc<dyn SamplesObserver> = observer.clone();
    *observer.this.lock() = Some(as_dyn.clone());
    AllocationSampler::get().add_samples_observer(as_dyn);
    let sampler = AllocationSampler::get();

    sampler.record_alloc(0xA0_000, 8192, AllocatorType::Manual, None);
    assert_eq!(observer.inner.added().len(), 1);

    // Gone after removing itself; later crossings reach no one. The thread
    // state reset on this stopped-sampler call also clears the backlog.
    sampler.record_alloc(0xA0_008, 8192, AllocatorType::Manual, None);
    assert_eq!(observer.inner.added().len(), 1);

    sampler.record_free(0xA0_000);
}

#[test]
fn nested_thread_mute_guards_panic() {
    let _outer = ScopedMuteThreadSamples::new();
    let result = catch_unwind(ScopedMuteThreadSamples::new);
    assert!(result.is_err());
    // The failed attempt must not have unmuted the thread.
    assert!(ScopedMuteThreadSamples::is_muted());
}

#[test]
fn nested_randomness_suppression_panics() {
    let _serial = TEST_GUARD.lock();
    let _outer = ScopedSuppressRandomness::new();
    let result = catch_unwind(ScopedSuppressRandomness::new);
    assert!(result.is_err());
}

#[test]
fn muting_hooked_samples_twice_panics() {
    let _serial = TEST_GUARD.lock();
    let _outer = AllocationSampler::get().mute_hooked_samples_for_testing();
    let result = catch_unwind(|| AllocationSampler::get().mute_hooked_samples_for_testing());
    assert!(result.is_err());
}
