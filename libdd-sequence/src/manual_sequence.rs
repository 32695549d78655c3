// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A queue pumped by the calling thread, for tests that need to control
//! exactly when posted work runs.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use crate::sequence::{is_running_on, SequenceScope, Task, TaskSequence};
use crate::MutexExt;

/// A [`TaskSequence`] drained manually with [`ManualSequence::run_until_idle`].
///
/// Tasks can be posted from any thread; they run on whichever thread pumps
/// the queue. This models "drain pending tasks" in scenario tests without
/// spawning threads.
pub struct ManualSequence {
    state: Mutex<State>,
    self_weak: Weak<ManualSequence>,
}

struct State {
    tasks: VecDeque<Task>,
    stopped: bool,
}

impl ManualSequence {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            state: Mutex::new(State {
                tasks: VecDeque::new(),
                stopped: false,
            }),
            self_weak: self_weak.clone(),
        })
    }

    /// Runs queued tasks on the calling thread until none remain, including
    /// tasks posted by the tasks themselves.
    pub fn run_until_idle(&self) {
        loop {
            let task = self.state.lock_or_panic().tasks.pop_front();
            let Some(task) = task else { return };
            let Some(current) = self.self_weak.upgrade() else {
                return;
            };
            let _scope = SequenceScope::enter(current);
            task();
        }
    }

    /// Drops queued tasks and rejects everything posted afterwards.
    pub fn shutdown(&self) {
        let dropped = {
            let mut state = self.state.lock_or_panic();
            state.stopped = true;
            std::mem::take(&mut state.tasks)
        };
        // Queued tasks are dropped outside the lock; their captures may run
        // arbitrary Drop code.
        drop(dropped);
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.state.lock_or_panic().tasks.len()
    }
}

impl TaskSequence for ManualSequence {
    fn post_task(&self, task: Task) {
        let rejected = {
            let mut state = self.state.lock_or_panic();
            if state.stopped {
                Some(task)
            } else {
                state.tasks.push_back(task);
                None
            }
        };
        if rejected.is_some() {
            tracing::trace!("task dropped, sequence has shut down");
        }
    }

    fn runs_tasks_in_current_sequence(&self) -> bool {
        is_running_on(self)
    }
}
