// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The durable queue of HA work shared by every cooperating server.
//!
//! Each unfinished item is processed by at most one server at a time. A server
//! obtains an item by taking a lease on it with [`WorkQueue::take`], which must
//! select a claimable item and record the lease in one atomic step (a
//! compare-and-swap on the lease owner, never a read followed by a separate
//! write). Leases are not time-limited; they are dropped when the owner
//! reschedules or finishes the item, or when the cluster reports that the
//! owner has gone away and [`WorkQueue::release`] is called on its behalf.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::work::{
    HostId, NewWork, ServerId, Step, VmId, WorkId, WorkItem, WorkType,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("work queue backing store is unavailable")]
    Unavailable,

    #[error("work item {0} not found")]
    NotFound(WorkId),

    #[error("lease on {id} is held by {holder:?}, not {server}")]
    LeaseLost { id: WorkId, server: ServerId, holder: Option<ServerId> },
}

/// Storage for HA work items.
pub trait WorkQueue: Send + Sync {
    /// Stores a new item and returns it with its assigned id.
    fn persist(&self, work: NewWork) -> Result<WorkItem, QueueError>;

    /// Atomically leases one unfinished, unleased item that is due, on behalf
    /// of `server`. Returns `Ok(None)` when nothing is claimable.
    fn take(&self, server: ServerId) -> Result<Option<WorkItem>, QueueError>;

    /// Writes back an item leased by `server`. Fails with
    /// [`QueueError::LeaseLost`] if `server` no longer holds the lease.
    fn update(
        &self,
        server: ServerId,
        item: &WorkItem,
    ) -> Result<(), QueueError>;

    /// Drops every lease held by `server` so its items can be taken by
    /// others. Returns the number of leases released.
    fn release(&self, server: ServerId) -> Result<usize, QueueError>;

    /// HA items for a VM, most recent first.
    fn find_previous_work(&self, vm: VmId)
        -> Result<Vec<WorkItem>, QueueError>;

    /// Unfinished items of any type for a VM.
    fn find_pending(&self, vm: VmId) -> Result<Vec<WorkItem>, QueueError>;

    /// Whether an unfinished item of `work_type` exists for a VM.
    fn has_been_scheduled(
        &self,
        vm: VmId,
        work_type: WorkType,
    ) -> Result<bool, QueueError>;

    /// Unfinished HA items for a VM that were created after `after`.
    fn list_future_ha_work(
        &self,
        vm: VmId,
        after: WorkId,
    ) -> Result<Vec<WorkItem>, QueueError>;

    /// Unfinished HA items for a VM that some server currently holds.
    fn list_running_ha_work(
        &self,
        vm: VmId,
    ) -> Result<Vec<WorkItem>, QueueError>;

    /// Unfinished items of `work_type` that some server currently holds.
    fn find_taken_work(
        &self,
        work_type: WorkType,
    ) -> Result<Vec<WorkItem>, QueueError>;

    /// Deletes unleased, unfinished items of `work_type` for a VM.
    fn delete_work(
        &self,
        vm: VmId,
        work_type: WorkType,
    ) -> Result<usize, QueueError>;

    /// Deletes unleased, unfinished items of `work_type` for a host.
    fn delete_unclaimed_for_host(
        &self,
        host: HostId,
        work_type: WorkType,
    ) -> Result<usize, QueueError>;

    /// Deletes finished items whose last attempt was before `before`.
    fn cleanup(&self, before: DateTime<Utc>) -> Result<usize, QueueError>;
}

struct Store {
    items: BTreeMap<WorkId, WorkItem>,
    next_id: u64,
    available: bool,
}

impl Store {
    fn check_available(&self) -> Result<(), QueueError> {
        if self.available {
            Ok(())
        } else {
            Err(QueueError::Unavailable)
        }
    }

    fn select<F>(&self, mut pred: F) -> Vec<WorkItem>
    where
        F: FnMut(&WorkItem) -> bool,
    {
        self.items.values().filter(|item| pred(item)).cloned().collect()
    }

    fn delete_where<F>(&mut self, mut pred: F) -> usize
    where
        F: FnMut(&WorkItem) -> bool,
    {
        let before = self.items.len();
        self.items.retain(|_, item| !pred(item));
        before - self.items.len()
    }
}

/// A [`WorkQueue`] kept in process memory. Every operation runs under a
/// single lock, which makes `take` an atomic compare-and-swap on the lease.
pub struct InMemoryWorkQueue {
    store: Mutex<Store>,
}

impl Default for InMemoryWorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        Self {
            store: Mutex::new(Store {
                items: BTreeMap::new(),
                next_id: 1,
                available: true,
            }),
        }
    }

    /// Simulates losing (or regaining) the backing store.
    pub fn set_available(&self, available: bool) {
        self.store.lock().unwrap().available = available;
    }

    /// Returns a copy of an item regardless of its state.
    pub fn get(&self, id: WorkId) -> Option<WorkItem> {
        self.store.lock().unwrap().items.get(&id).cloned()
    }

    /// Returns a copy of every stored item, in id order.
    pub fn snapshot(&self) -> Vec<WorkItem> {
        self.store.lock().unwrap().items.values().cloned().collect()
    }

    /// Takes the earliest-due claimable item as of `now`.
    pub fn take_at(
        &self,
        server: ServerId,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkItem>, QueueError> {
        let mut store = self.store.lock().unwrap();
        store.check_available()?;

        let candidate = store
            .items
            .values_mut()
            .filter(|item| {
                !item.is_done() && !item.is_taken() && item.time_to_try <= now
            })
            .min_by_key(|item| (item.time_to_try, item.id));

        let Some(item) = candidate else {
            return Ok(None);
        };

        item.taken_by = Some(server);
        item.date_taken = Some(now);
        Ok(Some(item.clone()))
    }
}

impl WorkQueue for InMemoryWorkQueue {
    fn persist(&self, work: NewWork) -> Result<WorkItem, QueueError> {
        let mut store = self.store.lock().unwrap();
        store.check_available()?;

        let id = WorkId(store.next_id);
        store.next_id += 1;
        let item = work.into_item(id, Utc::now());
        store.items.insert(id, item.clone());
        Ok(item)
    }

    fn take(&self, server: ServerId) -> Result<Option<WorkItem>, QueueError> {
        self.take_at(server, Utc::now())
    }

    fn update(
        &self,
        server: ServerId,
        item: &WorkItem,
    ) -> Result<(), QueueError> {
        let mut store = self.store.lock().unwrap();
        store.check_available()?;

        let stored = store
            .items
            .get_mut(&item.id)
            .ok_or(QueueError::NotFound(item.id))?;
        if stored.taken_by != Some(server) {
            return Err(QueueError::LeaseLost {
                id: item.id,
                server,
                holder: stored.taken_by,
            });
        }

        *stored = item.clone();
        Ok(())
    }

    fn release(&self, server: ServerId) -> Result<usize, QueueError> {
        let mut store = self.store.lock().unwrap();
        store.check_available()?;

        let mut released = 0;
        for item in store.items.values_mut() {
            if item.taken_by == Some(server) {
                item.release();
                released += 1;
            }
        }
        Ok(released)
    }

    fn find_previous_work(
        &self,
        vm: VmId,
    ) -> Result<Vec<WorkItem>, QueueError> {
        let store = self.store.lock().unwrap();
        store.check_available()?;
        let mut items = store.select(|item| {
            item.instance_id == vm && item.work_type == WorkType::HA
        });
        items.sort_by(|a, b| (b.created, b.id).cmp(&(a.created, a.id)));
        Ok(items)
    }

    fn find_pending(&self, vm: VmId) -> Result<Vec<WorkItem>, QueueError> {
        let store = self.store.lock().unwrap();
        store.check_available()?;
        Ok(store.select(|item| item.instance_id == vm && !item.is_done()))
    }

    fn has_been_scheduled(
        &self,
        vm: VmId,
        work_type: WorkType,
    ) -> Result<bool, QueueError> {
        let store = self.store.lock().unwrap();
        store.check_available()?;
        Ok(store.items.values().any(|item| {
            item.instance_id == vm
                && item.work_type == work_type
                && !item.is_done()
        }))
    }

    fn list_future_ha_work(
        &self,
        vm: VmId,
        after: WorkId,
    ) -> Result<Vec<WorkItem>, QueueError> {
        let store = self.store.lock().unwrap();
        store.check_available()?;
        Ok(store.select(|item| {
            item.instance_id == vm
                && item.work_type == WorkType::HA
                && item.id > after
                && !item.is_done()
        }))
    }

    fn list_running_ha_work(
        &self,
        vm: VmId,
    ) -> Result<Vec<WorkItem>, QueueError> {
        let store = self.store.lock().unwrap();
        store.check_available()?;
        Ok(store.select(|item| {
            item.instance_id == vm
                && item.work_type == WorkType::HA
                && item.is_taken()
                && !item.is_done()
        }))
    }

    fn find_taken_work(
        &self,
        work_type: WorkType,
    ) -> Result<Vec<WorkItem>, QueueError> {
        let store = self.store.lock().unwrap();
        store.check_available()?;
        Ok(store.select(|item| {
            item.work_type == work_type && item.is_taken() && !item.is_done()
        }))
    }

    fn delete_work(
        &self,
        vm: VmId,
        work_type: WorkType,
    ) -> Result<usize, QueueError> {
        let mut store = self.store.lock().unwrap();
        store.check_available()?;
        Ok(store.delete_where(|item| {
            item.instance_id == vm
                && item.work_type == work_type
                && !item.is_taken()
                && !item.is_done()
        }))
    }

    fn delete_unclaimed_for_host(
        &self,
        host: HostId,
        work_type: WorkType,
    ) -> Result<usize, QueueError> {
        let mut store = self.store.lock().unwrap();
        store.check_available()?;
        Ok(store.delete_where(|item| {
            item.host_id == host
                && item.work_type == work_type
                && !item.is_taken()
                && !item.is_done()
        }))
    }

    fn cleanup(&self, before: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut store = self.store.lock().unwrap();
        store.check_available()?;
        Ok(store.delete_where(|item| {
            item.step == Step::Done && item.time_to_try < before
        }))
    }
}
