// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Notification dispatch over a registry of sequence-bound observers.
//!
//! Every notification is delivered as one task per observer, posted to the
//! sequence that observer was added from. The dispatcher never invokes an
//! observer inline on the notifying thread and never holds its bookkeeping
//! lock while observer code runs, so observers are free to call back into
//! the dispatcher from inside a callback.

use std::any::Any;
use std::cell::RefCell;
use std::sync::{Arc, Mutex, Weak};

use libdd_sequence::{current_task_sequence, MutexExt, TaskSequence};

use crate::registry::{ObserverRegistry, RegistrationId};

/// Which observers a notification round reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotifyPolicy {
    /// Observers added while a round is being delivered on the adding thread
    /// also receive that round.
    #[default]
    All,
    /// Only observers already registered when [`ObserverDispatcher::notify`]
    /// was called receive the round.
    ExistingOnly,
}

/// Which sequences may remove a given observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemovalPolicy {
    /// Any thread may remove any observer.
    #[default]
    AnySequence,
    /// [`ObserverDispatcher::remove_observer`] must run on the sequence the
    /// observer was added from.
    AddingSequenceOnly,
}

/// Construction-time configuration of an [`ObserverDispatcher`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchOptions {
    pub notify_policy: NotifyPolicy,
    pub removal_policy: RemovalPolicy,
}

/// Result of [`ObserverDispatcher::add_observer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddObserverResult {
    /// The registry was empty and this call registered its first observer.
    /// Callers gating event production on observer presence should start
    /// producing when they see this.
    BecameNonEmpty,
    WasAlreadyNonEmpty,
}

/// Result of [`ObserverDispatcher::remove_observer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveObserverResult {
    /// No observers remain after this call. Also returned when the observer
    /// was not registered and the registry is empty.
    WasOrBecameEmpty,
    RemainsNonEmpty,
}

/// The closure for one notification round, shared by every delivery task of
/// that round.
struct NotifyPayload<O: ?Sized> {
    invoke: Box<dyn Fn(&O) + Send + Sync>,
}

/// One level of notification dispatch running on the current thread.
struct DispatchFrame {
    /// Address of the [`DispatcherInner`] delivering this frame.
    dispatcher: usize,
    /// Type-erased `Arc<NotifyPayload<O>>` of the round being delivered.
    payload: Arc<dyn Any + Send + Sync>,
}

thread_local! {
    /// Stack of in-flight dispatches on this thread. Nested deeper than one
    /// only when an observer callback pumps another sequence inline.
    static DISPATCH_FRAMES: RefCell<Vec<DispatchFrame>> = const { RefCell::new(Vec::new()) };
}

/// RAII guard for one [`DispatchFrame`]. Pops on drop, including panic
/// unwinds out of an observer callback.
struct FrameScope;

impl FrameScope {
    fn enter(dispatcher: usize, payload: Arc<dyn Any + Send + Sync>) -> Self {
        DISPATCH_FRAMES.with(|frames| {
            frames.borrow_mut().push(DispatchFrame {
                dispatcher,
                payload,
            });
        });
        Self
    }
}

impl Drop for FrameScope {
    fn drop(&mut self) {
        DISPATCH_FRAMES.with(|frames| {
            frames.borrow_mut().pop();
        });
    }
}

/// Payload of the innermost frame on this thread, if it belongs to the given
/// dispatcher.
fn current_frame_payload(dispatcher: usize) -> Option<Arc<dyn Any + Send + Sync>> {
    DISPATCH_FRAMES.with(|frames| {
        let frames = frames.borrow();
        let frame = frames.last()?;
        (frame.dispatcher == dispatcher).then(|| frame.payload.clone())
    })
}

/// Identity of an observer: the address of its `Arc` allocation. Stable
/// across clones of the same `Arc`, distinct across allocations.
fn observer_key<O: ?Sized>(observer: &Arc<O>) -> usize {
    Arc::as_ptr(observer) as *const () as usize
}

struct DispatcherInner<O: ?Sized + Send + Sync + 'static> {
    options: DispatchOptions,
    registry: Mutex<ObserverRegistry<O>>,
}

/// Thread-safe observer list with sequence-affine delivery.
///
/// Handles are cheap to clone and share one registry. Observers are held
/// weakly: the caller owns each observer `Arc` and must remove the observer
/// before dropping it.
///
/// Methods may be called from any thread, with two exceptions enforced at
/// run time: `add_observer` must run inside a task on a sequence, and under
/// [`RemovalPolicy::AddingSequenceOnly`] so must `remove_observer`, on the
/// matching sequence.
pub struct ObserverDispatcher<O: ?Sized + Send + Sync + 'static> {
    inner: Arc<DispatcherInner<O>>,
}

impl<O: ?Sized + Send + Sync + 'static> Clone for ObserverDispatcher<O> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<O: ?Sized + Send + Sync + 'static> Default for ObserverDispatcher<O> {
    fn default() -> Self {
        Self::new(DispatchOptions::default())
    }
}

impl<O: ?Sized + Send + Sync + 'static> ObserverDispatcher<O> {
    pub fn new(options: DispatchOptions) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                options,
                registry: Mutex::new(ObserverRegistry::new()),
            }),
        }
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Registers `observer`, bound to the sequence the calling task is
    /// running on. All future notifications for it are posted there.
    ///
    /// Under [`NotifyPolicy::All`], if this call happens inside one of this
    /// dispatcher's own notification rounds on the current thread, the new
    /// observer also receives that round's event, as a fresh task on its
    /// sequence.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is not running a task on a sequence, or
    /// if `observer` is already registered with this dispatcher.
    pub fn add_observer(&self, observer: &Arc<O>) -> AddObserverResult {
        #[allow(clippy::panic)]
        let Some(sequence) = current_task_sequence() else {
            panic!("add_observer must be called from a task running on a sequence")
        };
        let key = observer_key(observer);
        let (result, forward) = {
            let mut registry = self.inner.registry.lock_or_panic();
            let was_empty = registry.is_empty();
            let id = registry.insert(key, sequence.clone(), Arc::downgrade(observer));
            let forward = match self.inner.options.notify_policy {
                NotifyPolicy::All => current_frame_payload(self.key())
                    .and_then(|payload| payload.downcast::<NotifyPayload<O>>().ok())
                    .map(|payload| (id, payload)),
                NotifyPolicy::ExistingOnly => None,
            };
            let result = if was_empty {
                AddObserverResult::BecameNonEmpty
            } else {
                AddObserverResult::WasAlreadyNonEmpty
            };
            (result, forward)
        };
        if let Some((id, payload)) = forward {
            post_delivery(&self.inner, &sequence, key, id, payload);
        }
        result
    }

    /// Unregisters `observer`. Once this returns, no delivery task scheduled
    /// after this point will invoke it; tasks already posted find their
    /// generation stale and are dropped. A callback already executing on
    /// another thread may still be running when this returns.
    ///
    /// Removing an observer that was never added is a no-op apart from the
    /// returned emptiness state.
    ///
    /// # Panics
    ///
    /// Under [`RemovalPolicy::AddingSequenceOnly`], panics if the calling
    /// context is not the sequence `observer` was added from.
    pub fn remove_observer(&self, observer: &Arc<O>) -> RemoveObserverResult {
        let key = observer_key(observer);
        let (removed, result) = {
            let mut registry = self.inner.registry.lock_or_panic();
            let removed = match registry.get(key) {
                Some(entry) => {
                    if self.inner.options.removal_policy == RemovalPolicy::AddingSequenceOnly {
                        assert!(
                            entry.sequence.runs_tasks_in_current_sequence(),
                            "remove_observer must run on the sequence that added this observer"
                        );
                    }
                    registry.remove(key)
                }
                None => None,
            };
            let result = if registry.is_empty() {
                RemoveObserverResult::WasOrBecameEmpty
            } else {
                RemoveObserverResult::RemainsNonEmpty
            };
            (removed, result)
        };
        // Dropping the registration can release the last handle to its
        // sequence, which can block on that sequence's shutdown. Keep that
        // outside the registry lock.
        drop(removed);
        result
    }

    /// Delivers `invoke` to every registered observer by posting one task to
    /// each observer's sequence, then returns without waiting for any of
    /// them to run.
    pub fn notify(&self, invoke: impl Fn(&O) + Send + Sync + 'static) {
        let payload = Arc::new(NotifyPayload {
            invoke: Box::new(invoke),
        });
        let registry = self.inner.registry.lock_or_panic();
        for (key, entry) in registry.iter() {
            post_delivery(&self.inner, &entry.sequence, key, entry.id, payload.clone());
        }
    }
}

fn post_delivery<O: ?Sized + Send + Sync + 'static>(
    inner: &Arc<DispatcherInner<O>>,
    sequence: &Arc<dyn TaskSequence>,
    key: usize,
    id: RegistrationId,
    payload: Arc<NotifyPayload<O>>,
) {
    // The task holds the dispatcher weakly so queued deliveries do not keep
    // a dropped dispatcher alive.
    let dispatcher = Arc::downgrade(inner);
    sequence.post_task(Box::new(move || deliver(&dispatcher, key, id, &payload)));
}

fn deliver<O: ?Sized + Send + Sync + 'static>(
    dispatcher: &Weak<DispatcherInner<O>>,
    key: usize,
    id: RegistrationId,
    payload: &Arc<NotifyPayload<O>>,
) {
    let Some(inner) = dispatcher.upgrade() else {
        // Dispatcher dropped after this task was posted.
        return;
    };
    let observer = {
        let registry = inner.registry.lock_or_panic();
        match registry.validate(key, id) {
            Some(entry) => {
                let observer = entry.observer.upgrade();
                debug_assert!(
                    observer.is_some(),
                    "observer {key:#x} was dropped while still registered"
                );
                observer
            }
            // Removed, or removed and re-added, since this task was posted.
            None => None,
        }
    };
    let Some(observer) = observer else {
        return;
    };
    let frame_payload: Arc<dyn Any + Send + Sync> = payload.clone();
    let _frame = FrameScope::enter(Arc::as_ptr(&inner) as usize, frame_payload);
    (payload.invoke)(observer.as_ref());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observer_key_is_stable_across_clones() {
        let first: Arc<str> = Arc::from("observer");
        let second = first.clone();
        let other: Arc<str> = Arc::from("observer");
        assert_eq!(observer_key(&first), observer_key(&second));
        assert_ne!(observer_key(&first), observer_key(&other));
    }

    #[test]
    fn frame_payload_is_visible_only_to_its_dispatcher() {
        let payload: Arc<dyn Any + Send + Sync> = Arc::new(NotifyPayload::<()> {
            invoke: Box::new(|_| {}),
        });
        assert!(current_frame_payload(0x10).is_none());
        {
            let _frame = FrameScope::enter(0x10, payload);
            assert!(current_frame_payload(0x10).is_some());
            assert!(current_frame_payload(0x20).is_none());
        }
        assert!(current_frame_payload(0x10).is_none());
    }

    #[test]
    fn inner_frames_shadow_outer_ones() {
        let outer: Arc<dyn Any + Send + Sync> = Arc::new(NotifyPayload::<()> {
            invoke: Box::new(|_| {}),
        });
        let _outer = FrameScope::enter(0x10, outer);
        {
            let inner: Arc<dyn Any + Send + Sync> = Arc::new(NotifyPayload::<()> {
                invoke: Box::new(|_| {}),
            });
            let _inner = FrameScope::enter(0x20, inner);
            assert!(current_frame_payload(0x10).is_none());
            assert!(current_frame_payload(0x20).is_some());
        }
        assert!(current_frame_payload(0x10).is_some());
    }
}
