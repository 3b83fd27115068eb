// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HA work items and the identifiers they refer to.

use std::fmt;

use chrono::{DateTime, Utc};
use strum::{Display, EnumIter};

use crate::vm_state::State;

macro_rules! id_newtype {
    ($(#[$attr:meta])* $name:ident, $prefix:literal) => {
        $(#[$attr])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

id_newtype!(
    /// Identifies a virtual machine.
    VmId,
    "vm"
);
id_newtype!(
    /// Identifies a hypervisor (or storage) host.
    HostId,
    "host"
);
id_newtype!(
    /// Identifies a server process that takes leases on work items.
    ServerId,
    "server"
);
id_newtype!(
    /// Identifies a work item. Assigned by the queue when the item is
    /// persisted.
    WorkId,
    "work"
);
id_newtype!(ZoneId, "zone");
id_newtype!(PodId, "pod");

/// The role a VM plays in the cloud. Infrastructure VMs are restarted ahead of
/// user VMs when a host fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
pub enum VmType {
    DomainRouter,
    ConsoleProxy,
    SecondaryStorageVm,
    User,
}

/// The kind of recovery a work item asks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum WorkType {
    /// Restart a VM whose host failed.
    HA,
    /// Move a VM off a host that is being evacuated.
    Migration,
    /// Stop a VM unconditionally.
    Stop,
    /// Stop a VM if nothing about it changed since the work was scheduled.
    CheckStop,
    /// Force-stop a VM if nothing about it changed since the work was
    /// scheduled.
    ForceStop,
    /// Finish destroying a VM.
    Destroy,
}

/// How far processing of a work item has progressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum Step {
    Scheduled,
    Investigating,
    Migrating,
    Done,
}

/// A unit of HA work as stored in the work queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkItem {
    pub id: WorkId,
    pub instance_id: VmId,
    pub vm_type: VmType,
    pub work_type: WorkType,
    pub step: Step,

    /// The host the VM was last known to be on.
    pub host_id: HostId,

    /// The VM's state when the work was scheduled (or last re-armed).
    pub previous_state: State,

    /// The VM's update counter alongside `previous_state`.
    pub previous_update_counter: u64,

    pub times_tried: u32,

    /// The item may not be taken before this time.
    pub time_to_try: DateTime<Utc>,

    /// The server holding the lease on this item, if any.
    pub taken_by: Option<ServerId>,
    pub date_taken: Option<DateTime<Utc>>,

    pub created: DateTime<Utc>,
}

impl WorkItem {
    pub fn is_done(&self) -> bool {
        self.step == Step::Done
    }

    pub fn is_taken(&self) -> bool {
        self.taken_by.is_some()
    }

    /// Whether a new item for the same VM should get a fresh retry budget
    /// rather than inherit this item's attempt count.
    pub fn can_schedule_new(
        &self,
        time_between_failures: chrono::Duration,
        now: DateTime<Utc>,
    ) -> bool {
        self.time_to_try + time_between_failures < now
    }

    /// Gives up this item's lease and makes it eligible again at `when`,
    /// charging one attempt.
    pub fn reschedule(&mut self, when: DateTime<Utc>) {
        self.time_to_try = when;
        self.times_tried += 1;
        self.release();
    }

    pub(crate) fn release(&mut self) {
        self.taken_by = None;
        self.date_taken = None;
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}, {}, {}, {}, tried {}]",
            self.id,
            self.work_type,
            self.instance_id,
            self.host_id,
            self.step,
            self.times_tried
        )
    }
}

/// The caller-supplied portion of a work item; the queue fills in the rest
/// when it persists the item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewWork {
    pub instance_id: VmId,
    pub vm_type: VmType,
    pub work_type: WorkType,
    pub step: Step,
    pub host_id: HostId,
    pub previous_state: State,
    pub previous_update_counter: u64,
    pub times_tried: u32,
}

impl NewWork {
    /// Builds the stored form of this work, claimable from `now`.
    pub fn into_item(self, id: WorkId, now: DateTime<Utc>) -> WorkItem {
        WorkItem {
            id,
            instance_id: self.instance_id,
            vm_type: self.vm_type,
            work_type: self.work_type,
            step: self.step,
            host_id: self.host_id,
            previous_state: self.previous_state,
            previous_update_counter: self.previous_update_counter,
            times_tried: self.times_tried,
            time_to_try: now,
            taken_by: None,
            date_taken: None,
            created: now,
        }
    }
}
