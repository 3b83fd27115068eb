// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Worker and cleanup threads.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use chrono::Utc;
use slog::{debug, error, info, warn, Logger};

use super::{seconds, HaError, Inner, Orchestrator};
use crate::queue::QueueError;
use crate::work::{Step, WorkItem};

struct WakeState {
    generation: u64,
    stopping: bool,
}

/// Lets scheduling calls rouse every idle worker at once.
///
/// A worker samples the generation before looking for work and sleeps only
/// while it is unchanged, so a wake that lands between an empty `take` and
/// the wait is not lost.
pub(super) struct WakeSignal {
    state: Mutex<WakeState>,
    cv: Condvar,
}

impl WakeSignal {
    pub(super) fn new() -> Self {
        Self {
            state: Mutex::new(WakeState { generation: 0, stopping: false }),
            cv: Condvar::new(),
        }
    }

    pub(super) fn generation(&self) -> u64 {
        self.state.lock().unwrap().generation
    }

    pub(super) fn wake_all(&self) {
        let mut state = self.state.lock().unwrap();
        state.generation = state.generation.wrapping_add(1);
        self.cv.notify_all();
    }

    pub(super) fn is_stopping(&self) -> bool {
        self.state.lock().unwrap().stopping
    }

    fn set_stopping(&self, stopping: bool) {
        let mut state = self.state.lock().unwrap();
        state.stopping = stopping;
        self.cv.notify_all();
    }

    /// Waits up to `timeout` for the generation to move past `seen`.
    fn wait_for_work(&self, seen: u64, timeout: Duration) {
        let guard = self.state.lock().unwrap();
        let _ = self
            .cv
            .wait_timeout_while(guard, timeout, |s| {
                s.generation == seen && !s.stopping
            })
            .unwrap();
    }

    /// Waits up to `timeout` for a stop request.
    fn wait_for_stop(&self, timeout: Duration) {
        let guard = self.state.lock().unwrap();
        let _ = self
            .cv
            .wait_timeout_while(guard, timeout, |s| !s.stopping)
            .unwrap();
    }
}

impl Inner {
    /// Leases and processes one item. Returns `false` if there was nothing to
    /// take.
    pub(super) fn process_next(&self, log: &Logger) -> bool {
        let work = match self.queue.take(self.server_id) {
            Ok(Some(work)) => work,
            Ok(None) => return false,
            Err(e) => {
                warn!(log, "unable to check the work queue"; "error" => %e);
                return false;
            }
        };

        let id = work.id;
        let attempt = work.clone();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.process_work(log, work)
        }));
        let recorded = match outcome {
            Ok(recorded) => recorded,
            Err(_) => {
                error!(log, "work processing panicked"; "work" => %id);
                let fallback = attempt.clone();
                let concluded = panic::catch_unwind(AssertUnwindSafe(|| {
                    let item_log = self.work_log(log, &fallback);
                    self.conclude(
                        &item_log,
                        fallback,
                        Err(HaError::Panicked(id)),
                    )
                }));
                match concluded {
                    Ok(recorded) => recorded,
                    Err(_) => {
                        error!(log, "recording panicked work also panicked";
                               "work" => %id);
                        self.abandon(attempt)
                    }
                }
            }
        };
        if let Err(e) = recorded {
            error!(log, "failed to record work outcome";
                   "work" => %id,
                   "error" => %e);
        }

        true
    }

    /// Charges an attempt and hands the item back to the queue without
    /// consulting any collaborator.
    fn abandon(&self, mut work: WorkItem) -> Result<WorkItem, QueueError> {
        work.reschedule(self.after(self.retry_interval(work.work_type)));
        if work.times_tried >= self.config.max_retries {
            work.step = Step::Done;
        }
        self.queue.update(self.server_id, &work)?;
        Ok(work)
    }

    fn worker_loop(&self, log: Logger) {
        info!(log, "HA worker starting");
        while !self.wake.is_stopping() {
            let seen = self.wake.generation();
            if !self.process_next(&log) {
                self.wake.wait_for_work(seen, self.config.time_to_sleep());
            }
        }
        info!(log, "HA worker exiting");
    }

    /// Periodically deletes finished items older than the failure window.
    fn cleanup_loop(&self, log: Logger) {
        while !self.wake.is_stopping() {
            let window = seconds(self.config.time_between_failures);
            let cutoff = Utc::now() - window;
            match self.queue.cleanup(cutoff) {
                Ok(0) => {}
                Ok(deleted) => {
                    info!(log, "cleaned up finished work";
                          "deleted" => deleted);
                }
                Err(e) => {
                    warn!(log, "work cleanup failed"; "error" => %e);
                }
            }
            self.wake.wait_for_stop(self.config.time_between_cleanup());
        }
        debug!(log, "HA cleanup exiting");
    }
}

impl Orchestrator {
    /// Starts the worker and cleanup threads.
    ///
    /// Leases recorded under this server's id belong to a previous run that
    /// can no longer be processing them, so they are released first.
    pub fn start(&self) -> Result<(), HaError> {
        let inner = &self.inner;
        let mut threads = self.threads.lock().unwrap();
        if !threads.is_empty() {
            return Ok(());
        }

        let released = inner.queue.release(inner.server_id)?;
        if released > 0 {
            info!(inner.log, "released leases from a previous run";
                  "released" => released);
        }
        inner.wake.set_stopping(false);

        let spawn = |name: String, body: fn(&Inner, Logger)| {
            let inner = Arc::clone(&self.inner);
            let log = inner.log.new(slog::o!("thread" => name.clone()));
            std::thread::Builder::new()
                .name(name)
                .spawn(move || body(inner.as_ref(), log))
                .map_err(HaError::ThreadSpawnFailed)
        };

        for i in 0..inner.config.workers {
            match spawn(format!("ha-worker-{i}"), Inner::worker_loop) {
                Ok(handle) => threads.push(handle),
                Err(e) => {
                    drop(threads);
                    self.stop();
                    return Err(e);
                }
            }
        }
        match spawn("ha-cleanup".to_string(), Inner::cleanup_loop) {
            Ok(handle) => threads.push(handle),
            Err(e) => {
                drop(threads);
                self.stop();
                return Err(e);
            }
        }

        info!(inner.log, "HA orchestrator started";
              "workers" => inner.config.workers);
        Ok(())
    }

    /// Stops and joins every thread. Work in progress is finished first.
    pub fn stop(&self) {
        let threads: Vec<_> =
            self.threads.lock().unwrap().drain(..).collect();
        if threads.is_empty() {
            return;
        }

        self.inner.wake.set_stopping(true);
        for thread in threads {
            if thread.join().is_err() {
                error!(self.inner.log, "HA thread panicked");
            }
        }
        info!(self.inner.log, "HA orchestrator stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.threads.lock().unwrap().is_empty()
    }
}
