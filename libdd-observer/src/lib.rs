// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Thread-safe observer registration and notification dispatch.
//!
//! An [`ObserverDispatcher`] maps observers to the task sequence each one was
//! added from and delivers every notification as a task posted to that
//! sequence. Observer callbacks therefore always run on their owner's
//! sequence, never on the notifying thread, and never under the dispatcher's
//! internal lock.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod dispatcher;
mod registry;

pub use dispatcher::{
    AddObserverResult, DispatchOptions, NotifyPolicy, ObserverDispatcher, RemovalPolicy,
    RemoveObserverResult,
};
