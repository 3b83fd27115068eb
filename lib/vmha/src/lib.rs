// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! VM lifecycle state machine and high-availability work engine.
//!
//! [`vm_state`] defines the states a VM moves through and the only legal
//! transitions between them. [`orchestrator`] recovers VMs when hosts fail:
//! it queues [`work::WorkItem`]s in a [`queue::WorkQueue`] shared by a
//! cluster of servers, investigates and fences suspect VMs, and drives
//! restarts, migrations, stops and destroys through the collaborators in
//! [`lifecycle`]. [`sim`] provides an in-memory cloud for exercising all of
//! it without real hosts.

pub mod cluster;
pub mod investigate;
pub mod lifecycle;
pub mod orchestrator;
pub mod queue;
pub mod sim;
pub mod vm_state;
pub mod work;

pub use cluster::ClusterListener;
pub use orchestrator::{Collaborators, HaError, Orchestrator};
pub use vmha_config as config;
