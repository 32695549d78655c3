// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Sequenced task execution.
//!
//! A [`TaskSequence`] is a place where callbacks run later, in FIFO order for
//! that place, potentially on another thread. Code running inside a posted
//! task can recover the sequence it is running on through
//! [`current_task_sequence`], which is how callers of higher-level APIs (such
//! as observer registration) get bound to a home sequence without passing one
//! explicitly.
//!
//! Two implementations are provided: [`SerialSequence`], backed by a
//! dedicated worker thread, and (behind the `test-utils` feature)
//! `ManualSequence`, a queue pumped by the calling thread.

use std::sync::{Mutex, MutexGuard};

#[cfg(any(test, feature = "test-utils"))]
pub mod manual_sequence;
pub mod sequence;
pub mod serial_sequence;

#[cfg(any(test, feature = "test-utils"))]
pub use manual_sequence::ManualSequence;
pub use sequence::{current_task_sequence, is_running_on, SequenceScope, Task, TaskSequence};
pub use serial_sequence::{SerialSequence, SpawnError};

/// Extension trait for `Mutex` to provide a method that acquires a lock, panicking if the lock is
/// poisoned.
///
/// This helper function is intended to be used to avoid having to add many
/// `#[allow(clippy::unwrap_used)]` annotations if there are a lot of usages of `Mutex`.
///
/// # Panics
///
/// This function will panic if the `Mutex` is poisoned.
///
/// # Examples
///
/// ```
/// use libdd_sequence::MutexExt;
/// use std::sync::{Arc, Mutex};
///
/// let data = Arc::new(Mutex::new(5));
/// let data_clone = Arc::clone(&data);
///
/// std::thread::spawn(move || {
///     let mut num = data_clone.lock_or_panic();
///     *num += 1;
/// })
/// .join()
/// .expect("Thread panicked");
///
/// assert_eq!(*data.lock_or_panic(), 6);
/// ```
pub trait MutexExt<T> {
    fn lock_or_panic(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    #[inline(always)]
    #[track_caller]
    fn lock_or_panic(&self) -> MutexGuard<'_, T> {
        #[allow(clippy::unwrap_used)]
        self.lock().unwrap()
    }
}
