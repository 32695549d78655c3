// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Poisson allocation sampler.
//!
//! One process-wide [`AllocationSampler`] receives every allocation and free
//! from the hook layer. It keeps a signed per-thread byte accumulator; an
//! allocation is sampled when the accumulator crosses zero, after which fresh
//! exponentially distributed intervals are subtracted until it is negative
//! again. Each crossing counts one sample, and the aggregate
//! `total_allocated = mean_interval * crossings` is reported to observers
//! together with the real address and size of the triggering allocation.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use rand::Rng;

use crate::address_set::LockFreeAddressHashSet;

/// 128 KiB between samples on average.
const DEFAULT_SAMPLING_INTERVAL: usize = 128 * 1024;

const INITIAL_BUCKETS: usize = 64;

/// Pulled out of the accumulator while a thread is muted. Muting starts
/// right after a sample is taken, so without the offset the pending interval
/// would fire again the moment muting ends, skewing the process toward
/// oversampling.
const ACCUMULATED_BYTES_OFFSET: isize = 1 << 29;

/// Process-wide deterministic-intervals flag, set by
/// [`ScopedSuppressRandomness`].
static DETERMINISTIC: AtomicBool = AtomicBool::new(false);

/// One-shot flag: the hook layer has been activated. Never cleared.
static HOOKS_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Set by [`ScopedMuteHookedSamples`] to deactivate the hook layer without
/// uninstalling it.
static HOOKS_MUTED: AtomicBool = AtomicBool::new(false);

struct ThreadState {
    accumulated_bytes: Cell<isize>,
    interval_initialized: Cell<bool>,
    muted: Cell<bool>,
    reentered: Cell<bool>,
}

thread_local! {
    // Const-initialized so first access inside an allocation hook neither
    // allocates nor registers a destructor.
    static THREAD_STATE: ThreadState = const {
        ThreadState {
            accumulated_bytes: Cell::new(0),
            interval_initialized: Cell::new(false),
            muted: Cell::new(false),
            reentered: Cell::new(false),
        }
    };
}

/// Which allocator reported an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorType {
    /// The [`SamplingAllocator`](crate::SamplingAllocator) global shim.
    GlobalShim,
    /// An out-of-process or foreign allocator feeding events in.
    External,
    /// Events reported directly by instrumentation code.
    Manual,
}

/// Receiver for sampling events. Callbacks run on the allocating thread,
/// inside a muted scope and outside the sampler lock, so they may allocate
/// and may call back into the sampler.
pub trait SamplesObserver: Send + Sync {
    fn sample_added(
        &self,
        address: usize,
        size: usize,
        total_allocated: usize,
        allocator_type: AllocatorType,
        context: Option<&'static str>,
    );

    fn sample_removed(&self, address: usize);
}

struct SharedState {
    observers: Vec<Arc<dyn SamplesObserver>>,
    hooks_install_callback: Option<Box<dyn FnOnce() + Send>>,
    install_callback_was_set: bool,
}

/// Process-wide Poisson sampler over the allocation stream.
///
/// Lives for the lifetime of the process once touched; obtain it through
/// [`AllocationSampler::get`]. With no observers registered the sampler is
/// stopped: record calls reset per-thread state and return. Registering the
/// first observer starts it and activates the hook layer once.
pub struct AllocationSampler {
    running: AtomicBool,
    sampling_interval: AtomicUsize,
    /// Current table, replaced wholesale on growth. Old tables are leaked so
    /// readers that already loaded the pointer never dangle.
    sampled_addresses: AtomicPtr<LockFreeAddressHashSet>,
    shared: Mutex<SharedState>,
}

static SAMPLER: LazyLock<AllocationSampler> = LazyLock::new(AllocationSampler::new);

impl AllocationSampler {
    pub fn get() -> &'static AllocationSampler {
        &SAMPLER
    }

    fn new() -> Self {
        let initial = Box::new(LockFreeAddressHashSet::with_buckets(INITIAL_BUCKETS));
        Self {
            running: AtomicBool::new(false),
            sampling_interval: AtomicUsize::new(DEFAULT_SAMPLING_INTERVAL),
            sampled_addresses: AtomicPtr::new(Box::into_raw(initial)),
            shared: Mutex::new(SharedState {
                observers: Vec::new(),
                hooks_install_callback: None,
                install_callback_was_set: false,
            }),
        }
    }

    /// Mean number of bytes between samples.
    pub fn sampling_interval(&self) -> usize {
        self.sampling_interval.load(Ordering::Relaxed)
    }

    /// # Panics
    ///
    /// Panics if `bytes` is zero.
    pub fn set_sampling_interval(&self, bytes: usize) {
        assert!(bytes > 0, "sampling interval must be positive");
        self.sampling_interval.store(bytes, Ordering::Relaxed);
    }

    /// True once the first observer registration has activated the hook
    /// layer. Stays true even after all observers are removed.
    pub fn hooks_installed() -> bool {
        HOOKS_INSTALLED.load(Ordering::Relaxed)
    }

    fn sampled_addresses(&self) -> &LockFreeAddressHashSet {
        // SAFETY: the pointer always comes from Box::into_raw and replaced
        // tables are leaked, so whatever we load stays valid for the process
        // lifetime.
        unsafe { &*self.sampled_addresses.load(Ordering::Acquire) }
    }

    /// Grows the sampled-address table once its load factor reaches 1.
    /// Caller must hold `self.shared`.
    fn balance_sampled_addresses(&self) {
        let current = self.sampled_addresses();
        if current.load_factor() < 1.0 {
            return;
        }
        let grown = Box::new(LockFreeAddressHashSet::with_buckets(
            current.buckets_count() * 2,
        ));
        grown.copy_from(current);
        // Publish only after the copy is complete; readers see the old table
        // or the fully built new one, never a partial state. The old table
        // leaks.
        self.sampled_addresses
            .store(Box::into_raw(grown), Ordering::Release);
    }

    /// Reports one allocation. Called from allocator hooks, so the fast path
    /// (most calls) touches nothing but a thread-local counter.
    ///
    /// `address` of zero means a failed allocation and is never sampled.
    #[inline]
    pub fn record_alloc(
        &self,
        address: usize,
        size: usize,
        allocator_type: AllocatorType,
        context: Option<&'static str>,
    ) {
        let accumulated = THREAD_STATE.with(|state| {
            let accumulated = state.accumulated_bytes.get().wrapping_add(size as isize);
            state.accumulated_bytes.set(accumulated);
            accumulated
        });
        if accumulated < 0 {
            return;
        }
        if !self.running.load(Ordering::Relaxed) {
            // Hooks outlive the last observer; reset so a later restart sees
            // this thread as if it never allocated.
            THREAD_STATE.with(|state| {
                state.accumulated_bytes.set(0);
                state.interval_initialized.set(false);
            });
            return;
        }
        self.record_alloc_slow(address, size, allocator_type, context);
    }

    fn record_alloc_slow(
        &self,
        address: usize,
        size: usize,
        allocator_type: AllocatorType,
        context: Option<&'static str>,
    ) {
        // Failed allocation: nothing to sample.
        if address == 0 {
            return;
        }

        let mean_interval = self.sampling_interval();
        let samples = THREAD_STATE.with(|state| {
            let mut accumulated = state.accumulated_bytes.get();

            if !state.interval_initialized.get() {
                state.interval_initialized.set(true);
                // The zero-initialized accumulator crosses on a thread's
                // first allocation no matter how small it is. Draw a real
                // interval and re-check before counting a sample.
                accumulated -= next_sample_interval(mean_interval) as isize;
                if accumulated < 0 {
                    state.accumulated_bytes.set(accumulated);
                    return None;
                }
            }

            let mut samples = accumulated as usize / mean_interval;
            accumulated %= mean_interval as isize;
            loop {
                accumulated -= next_sample_interval(mean_interval) as isize;
                samples += 1;
                if accumulated < 0 {
                    break;
                }
            }
            state.accumulated_bytes.set(accumulated);

            // The crossing is consumed either way; muted and reentrant
            // callers just skip the fanout.
            if state.muted.get() || state.reentered.get() {
                return None;
            }
            Some(samples)
        });
        let Some(samples) = samples else {
            return;
        };

        // Everything below may allocate (set growth, observer snapshot,
        // observer callbacks); mute this thread so those allocations are
        // consumed without re-entering the slow path.
        let _mute = ScopedMuteThreadSamples::new();
        let observers = {
            let shared = self.shared.lock();
            if self.sampled_addresses().contains(address) {
                // Seen twice with no free in between; keep the first sample.
                tracing::debug!(address, "allocation address sampled twice in a row");
                return;
            }
            self.sampled_addresses().insert(address);
            self.balance_sampled_addresses();
            shared.observers.clone()
        };
        let total_allocated = mean_interval * samples;
        for observer in &observers {
            observer.sample_added(address, size, total_allocated, allocator_type, context);
        }
    }

    /// Reports one free. Unsampled addresses (the vast majority) are
    /// rejected by a lock-free lookup.
    #[inline]
    pub fn record_free(&self, address: usize) {
        if address == 0 {
            return;
        }
        if !self.sampled_addresses().contains(address) {
            return;
        }
        if ScopedMuteThreadSamples::is_muted() {
            return;
        }
        self.record_free_slow(address);
    }

    fn record_free_slow(&self, address: usize) {
        let _mute = ScopedMuteThreadSamples::new();
        let observers = {
            let shared = self.shared.lock();
            self.sampled_addresses().remove(address);
            shared.observers.clone()
        };
        for observer in &observers {
            observer.sample_removed(address);
        }
    }

    /// Registers `observer`. The first registration flips the sampler to
    /// running and activates the hook layer (once per process).
    ///
    /// # Panics
    ///
    /// Panics if `observer` is already registered.
    pub fn add_samples_observer(&self, observer: Arc<dyn SamplesObserver>) {
        let pending_callback = {
            // Reentry flag first: taking the mute scope touches thread-local
            // state, which on some platforms can itself allocate.
            let _reentry = ReentryGuard::enter();
            let _mute = thread_mute_scope();
            let mut shared = self.shared.lock();
            assert!(
                !shared
                    .observers
                    .iter()
                    .any(|existing| Arc::ptr_eq(existing, &observer)),
                "samples observer is already registered"
            );
            shared.observers.push(observer);
            let pending = if !HOOKS_INSTALLED.load(Ordering::Relaxed) {
                HOOKS_INSTALLED.store(true, Ordering::Relaxed);
                shared.hooks_install_callback.take()
            } else {
                None
            };
            self.running
                .store(!shared.observers.is_empty(), Ordering::Relaxed);
            pending
        };
        if let Some(callback) = pending_callback {
            callback();
        }
    }

    /// Unregisters `observer`; removing the last one stops the sampler.
    ///
    /// # Panics
    ///
    /// Panics if `observer` was never registered.
    pub fn remove_samples_observer(&self, observer: &Arc<dyn SamplesObserver>) {
        let removed = {
            let _reentry = ReentryGuard::enter();
            let _mute = thread_mute_scope();
            let mut shared = self.shared.lock();
            let index = shared
                .observers
                .iter()
                .position(|existing| Arc::ptr_eq(existing, observer));
            assert!(index.is_some(), "samples observer was never registered");
            let removed = index.map(|index| shared.observers.remove(index));
            self.running
                .store(!shared.observers.is_empty(), Ordering::Relaxed);
            removed
        };
        // The observer may run arbitrary drop code; keep that outside the
        // lock and the guards.
        drop(removed);
    }

    /// Registers a callback fired once the hook layer is active. If hooks
    /// are already installed the callback runs immediately on this thread;
    /// otherwise it runs on the thread whose observer registration installs
    /// them. Either way it runs outside the sampler lock.
    ///
    /// # Panics
    ///
    /// Panics on a second call, or while hooked samples are muted.
    pub fn set_hooks_install_callback(&self, callback: impl FnOnce() + Send + 'static) {
        assert!(
            !HOOKS_MUTED.load(Ordering::Relaxed),
            "cannot register a hooks-install callback while hooked samples are muted"
        );
        let immediate = {
            // Boxing the callback allocates; mute this thread so that
            // allocation cannot re-enter the slow path under the lock.
            let _mute = thread_mute_scope();
            let mut shared = self.shared.lock();
            assert!(
                !shared.install_callback_was_set,
                "hooks-install callback may only be set once"
            );
            shared.install_callback_was_set = true;
            if HOOKS_INSTALLED.load(Ordering::Relaxed) {
                Some(Box::new(callback) as Box<dyn FnOnce() + Send>)
            } else {
                shared.hooks_install_callback = Some(Box::new(callback));
                None
            }
        };
        if let Some(callback) = immediate {
            callback();
        }
    }

    /// Deactivates the hook layer until the returned guard drops, so tests
    /// can exercise hooks-not-installed behavior without tearing the sampler
    /// down. This thread's accumulator is parked at zero for the duration.
    ///
    /// # Panics
    ///
    /// Panics if hooked samples are already muted, or if a hooks-install
    /// callback has been registered.
    pub fn mute_hooked_samples_for_testing(&self) -> ScopedMuteHookedSamples {
        {
            let shared = self.shared.lock();
            assert!(
                !shared.install_callback_was_set,
                "cannot mute hooked samples while a hooks-install callback is registered"
            );
        }
        assert!(
            !HOOKS_MUTED.load(Ordering::Relaxed),
            "hooked samples are already muted"
        );
        HOOKS_MUTED.store(true, Ordering::Relaxed);
        let saved_accumulated_bytes = THREAD_STATE.with(|state| {
            let saved = state.accumulated_bytes.get();
            state.accumulated_bytes.set(0);
            saved
        });
        ScopedMuteHookedSamples {
            saved_accumulated_bytes,
            _not_send: PhantomData,
        }
    }
}

/// True while the allocator shim should report events.
pub(crate) fn hook_layer_active() -> bool {
    HOOKS_INSTALLED.load(Ordering::Relaxed) && !HOOKS_MUTED.load(Ordering::Relaxed)
}

/// Draws the byte distance to the next sample: `-ln(U) * mean`, exponential
/// with mean `mean_interval`, clamped to `[size_of::<usize>(), 20 * mean]`.
/// The upper clamp is hit with probability `exp(-20)` and exists to bound
/// gaps in the sample stream. Deterministic mode returns the mean unchanged.
///
/// Entropy comes from the OS on every draw; the thread-local generators of
/// `rand` lazily allocate, which is off-limits inside an allocation hook.
fn next_sample_interval(mean_interval: usize) -> usize {
    if DETERMINISTIC.load(Ordering::Relaxed) {
        return mean_interval;
    }
    let uniform: f64 = rand::rngs::OsRng.gen();
    let value = -uniform.ln() * mean_interval as f64;
    let min_value = std::mem::size_of::<usize>();
    let max_value = mean_interval * 20;
    if value < min_value as f64 {
        return min_value;
    }
    if value > max_value as f64 {
        return max_value;
    }
    value as usize
}

/// Mute scope used inside the sampler's own bookkeeping paths: a no-op when
/// the thread is already muted (an observer callback calling back into the
/// sampler), a real scope otherwise.
fn thread_mute_scope() -> Option<ScopedMuteThreadSamples> {
    (!ScopedMuteThreadSamples::is_muted()).then(ScopedMuteThreadSamples::new)
}

/// Marks the thread as inside sampler bookkeeping before any other
/// thread-local state is touched.
struct ReentryGuard {
    _not_send: PhantomData<*const ()>,
}

impl ReentryGuard {
    fn enter() -> Self {
        THREAD_STATE.with(|state| {
            debug_assert!(!state.reentered.get());
            state.reentered.set(true);
        });
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        THREAD_STATE.with(|state| state.reentered.set(false));
    }
}

/// While alive, this thread's record calls consume accounting state but
/// never fan out. The accumulator is offset downward on entry and restored
/// on exit.
///
/// # Panics
///
/// Creating a second guard on a thread that already holds one panics.
#[must_use]
pub struct ScopedMuteThreadSamples {
    _not_send: PhantomData<*const ()>,
}

impl ScopedMuteThreadSamples {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        THREAD_STATE.with(|state| {
            assert!(
                !state.muted.get(),
                "thread samples are already muted on this thread"
            );
            state.muted.set(true);
            state
                .accumulated_bytes
                .set(state.accumulated_bytes.get().wrapping_sub(ACCUMULATED_BYTES_OFFSET));
        });
        Self {
            _not_send: PhantomData,
        }
    }

    pub fn is_muted() -> bool {
        THREAD_STATE.with(|state| state.muted.get())
    }
}

impl Drop for ScopedMuteThreadSamples {
    fn drop(&mut self) {
        THREAD_STATE.with(|state| {
            debug_assert!(state.muted.get());
            state.muted.set(false);
            state
                .accumulated_bytes
                .set(state.accumulated_bytes.get().wrapping_add(ACCUMULATED_BYTES_OFFSET));
        });
    }
}

/// Forces deterministic sampling intervals while alive. Single-use: the flag
/// is process-wide, so tests holding this guard must not run concurrently
/// with each other or with production traffic.
///
/// Entry zeroes this thread's accumulator; leftover accumulation would make
/// the first deterministic crossing unpredictable.
///
/// # Panics
///
/// Panics if randomness suppression is already active.
#[must_use]
pub struct ScopedSuppressRandomness {
    _not_send: PhantomData<*const ()>,
}

impl ScopedSuppressRandomness {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        assert!(
            !DETERMINISTIC.load(Ordering::Relaxed),
            "randomness suppression is already active"
        );
        DETERMINISTIC.store(true, Ordering::Relaxed);
        THREAD_STATE.with(|state| state.accumulated_bytes.set(0));
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for ScopedSuppressRandomness {
    fn drop(&mut self) {
        debug_assert!(DETERMINISTIC.load(Ordering::Relaxed));
        DETERMINISTIC.store(false, Ordering::Relaxed);
    }
}

/// Hook layer deactivated until dropped; see
/// [`AllocationSampler::mute_hooked_samples_for_testing`].
#[must_use]
pub struct ScopedMuteHookedSamples {
    saved_accumulated_bytes: isize,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ScopedMuteHookedSamples {
    fn drop(&mut self) {
        THREAD_STATE.with(|state| state.accumulated_bytes.set(self.saved_accumulated_bytes));
        debug_assert!(HOOKS_MUTED.load(Ordering::Relaxed));
        HOOKS_MUTED.store(false, Ordering::Relaxed);
    }
}
