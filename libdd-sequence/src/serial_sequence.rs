// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};

use crate::sequence::{is_running_on, SequenceScope, Task, TaskSequence};
use crate::MutexExt;

/// Error returned by [`SerialSequence::spawn`] when the worker thread cannot
/// be created.
#[derive(Debug, thiserror::Error)]
#[error("failed to spawn sequence worker thread: {0}")]
pub struct SpawnError(#[from] io::Error);

/// A [`TaskSequence`] backed by a dedicated worker thread.
///
/// Tasks run one at a time in post order on the worker.
/// [`SerialSequence::shutdown`] stops intake, drops queued tasks that have
/// not started, and joins the worker; dropping the last handle does the same
/// implicitly. Tasks posted after shutdown are dropped, so holders of a
/// handle may keep posting without caring whether the sequence is still
/// alive.
pub struct SerialSequence {
    name: String,
    sender: Mutex<Option<Sender<Task>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl SerialSequence {
    /// Spawns the worker thread and returns a handle to the new sequence.
    pub fn spawn(name: &str) -> Result<Arc<Self>, SpawnError> {
        let (sender, receiver) = mpsc::channel();
        let sequence = Arc::new(Self {
            name: name.to_owned(),
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(None),
            stopped: AtomicBool::new(false),
        });
        let worker = Arc::downgrade(&sequence);
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || worker_loop(worker, receiver))?;
        *sequence.worker.lock_or_panic() = Some(handle);
        Ok(sequence)
    }

    /// Stops accepting tasks, drops queued tasks that have not started, and
    /// joins the worker thread.
    ///
    /// Safe to call more than once and from any thread, including from a
    /// task running on this sequence (the join is skipped there, and the
    /// worker exits once the current task returns).
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        drop(self.sender.lock_or_panic().take());
        let handle = self.worker.lock_or_panic().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::debug!(sequence = %self.name, "worker terminated by a panicked task");
            }
        }
    }
}

impl TaskSequence for SerialSequence {
    fn post_task(&self, task: Task) {
        // Rejected tasks are dropped outside the sender lock; their captures
        // may run arbitrary Drop code.
        let rejected = {
            let sender = self.sender.lock_or_panic();
            match sender.as_ref() {
                Some(sender) => sender.send(task).err().map(|error| error.0),
                None => Some(task),
            }
        };
        if rejected.is_some() {
            tracing::trace!(sequence = %self.name, "task dropped, sequence has shut down");
        }
    }

    fn runs_tasks_in_current_sequence(&self) -> bool {
        is_running_on(self)
    }
}

impl Drop for SerialSequence {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(sequence: Weak<SerialSequence>, tasks: Receiver<Task>) {
    while let Ok(task) = tasks.recv() {
        let Some(current) = sequence.upgrade() else {
            break;
        };
        if current.stopped.load(Ordering::Acquire) {
            break;
        }
        let _scope = SequenceScope::enter(current);
        task();
    }
    // Anything still queued is dropped with the receiver.
}
