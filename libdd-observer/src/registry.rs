// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bookkeeping for registered observers, keyed by observer identity.

use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::sync::{Arc, Weak};

use libdd_sequence::TaskSequence;

type FxBuildHasher = BuildHasherDefault<rustc_hash::FxHasher>;

/// Generation tag handed out once per successful registration.
///
/// Delivery tasks capture the id they were posted with; a task whose id no
/// longer matches the live entry belongs to an earlier registration of the
/// same observer and must not be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RegistrationId(u64);

/// One registered observer: the sequence it was added from, a weak reference
/// to the observer itself, and the generation it was registered under.
pub(crate) struct Registration<O: ?Sized> {
    pub(crate) sequence: Arc<dyn TaskSequence>,
    pub(crate) observer: Weak<O>,
    pub(crate) id: RegistrationId,
}

pub(crate) struct ObserverRegistry<O: ?Sized> {
    entries: HashMap<usize, Registration<O>, FxBuildHasher>,
    next_id: u64,
}

impl<O: ?Sized> ObserverRegistry<O> {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::default(),
            next_id: 0,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registers `observer` under `key` and returns the fresh generation id.
    ///
    /// # Panics
    ///
    /// Panics if `key` already has a live registration.
    pub(crate) fn insert(
        &mut self,
        key: usize,
        sequence: Arc<dyn TaskSequence>,
        observer: Weak<O>,
    ) -> RegistrationId {
        assert!(
            !self.entries.contains_key(&key),
            "observer {key:#x} is already registered with this dispatcher"
        );
        self.next_id += 1;
        let id = RegistrationId(self.next_id);
        self.entries.insert(
            key,
            Registration {
                sequence,
                observer,
                id,
            },
        );
        id
    }

    pub(crate) fn get(&self, key: usize) -> Option<&Registration<O>> {
        self.entries.get(&key)
    }

    /// Removes and returns the entry for `key`. The caller should drop the
    /// returned registration outside any dispatcher lock, since dropping its
    /// sequence handle can run sequence shutdown.
    pub(crate) fn remove(&mut self, key: usize) -> Option<Registration<O>> {
        self.entries.remove(&key)
    }

    /// Looks up `key` and keeps the entry only if it still carries `id`.
    pub(crate) fn validate(&self, key: usize, id: RegistrationId) -> Option<&Registration<O>> {
        self.entries.get(&key).filter(|entry| entry.id == id)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &Registration<O>)> + '_ {
        self.entries.iter().map(|(&key, entry)| (key, entry))
    }
}
