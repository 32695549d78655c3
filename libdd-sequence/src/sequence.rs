// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;

/// A unit of deferred work accepted by a [`TaskSequence`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A place where callbacks run later, in FIFO order for that place.
///
/// Implementations must run tasks one at a time, in post order, and must
/// install a [`SequenceScope`] around each run so that the task can observe
/// its own sequence through [`current_task_sequence`].
pub trait TaskSequence: Send + Sync + 'static {
    /// Enqueues `task` to run later on this sequence without blocking.
    ///
    /// A sequence that has shut down drops the task instead of running it;
    /// posting is never an error.
    fn post_task(&self, task: Task);

    /// Returns true iff the calling thread is currently running a task that
    /// was posted to this sequence.
    fn runs_tasks_in_current_sequence(&self) -> bool;
}

thread_local! {
    // Innermost-last stack of sequences the thread is running tasks for.
    // Deeper than one entry only when a task pumps another queue inline.
    static CURRENT_SEQUENCES: RefCell<Vec<Arc<dyn TaskSequence>>> = const { RefCell::new(Vec::new()) };
}

/// The sequence whose task the calling thread is currently running, if any.
pub fn current_task_sequence() -> Option<Arc<dyn TaskSequence>> {
    CURRENT_SEQUENCES.with(|stack| stack.borrow().last().cloned())
}

/// Compares `sequence` by address against the innermost sequence the calling
/// thread is running a task for.
///
/// This is the building block for
/// [`TaskSequence::runs_tasks_in_current_sequence`] implementations that use
/// [`SequenceScope`].
pub fn is_running_on<S: TaskSequence + ?Sized>(sequence: &S) -> bool {
    CURRENT_SEQUENCES.with(|stack| {
        stack
            .borrow()
            .last()
            .is_some_and(|current| std::ptr::addr_eq(Arc::as_ptr(current), sequence as *const S))
    })
}

/// Marks the calling thread as running a task for `sequence` until dropped.
///
/// Executor implementations hold one of these for the duration of each task
/// they run. Everything else should only read the state through
/// [`current_task_sequence`].
pub struct SequenceScope {
    // Scopes must unwind on the thread that entered them.
    _not_send: PhantomData<*const ()>,
}

impl SequenceScope {
    pub fn enter(sequence: Arc<dyn TaskSequence>) -> Self {
        CURRENT_SEQUENCES.with(|stack| stack.borrow_mut().push(sequence));
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for SequenceScope {
    fn drop(&mut self) {
        CURRENT_SEQUENCES.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}
