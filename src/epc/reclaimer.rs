// Copyright (C) 2023 Ant Group CO., Ltd. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The background reclaimer task.
//!
//! One dedicated thread per pool: it sanitizes the dirty queue once at
//! startup, then parks until either stop is requested or the high watermark
//! predicate holds, reclaiming one batch per wakeup. It never exits on a
//! failed batch; all per-page failures are logged and skipped.

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::error::EpcResult;

use super::{reclaim, EpcPool};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ReclaimerState {
    Sanitizing,
    Waiting,
    Reclaiming,
    Stopped,
}

/// Wait queue the reclaimer parks on. Wakers take the mutex before
/// notifying so a wakeup between predicate check and park cannot be lost.
pub(crate) struct WaitQueue {
    stop: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl WaitQueue {
    pub(crate) fn new() -> Self {
        Self {
            stop: AtomicBool::new(false),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub(crate) fn request_stop(&self) {
        let _guard = self.lock.lock().unwrap();
        self.stop.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    pub(crate) fn wake(&self) {
        let _guard = self.lock.lock().unwrap();
        self.cond.notify_all();
    }
}

pub(crate) fn spawn(pool: &Arc<EpcPool>) -> EpcResult<JoinHandle<()>> {
    let pool = Arc::clone(pool);
    thread::Builder::new()
        .name("epc-reclaimer".into())
        .spawn(move || run(&pool))
        .map_err(|e| epc_err!(EBUSY, format!("cannot start reclaimer task: {}", e)))
}

fn run(pool: &EpcPool) {
    let mut state = ReclaimerState::Sanitizing;
    loop {
        state = match state {
            ReclaimerState::Sanitizing => {
                reclaim::sanitize_dirty_pages(pool);
                ReclaimerState::Waiting
            }
            ReclaimerState::Waiting => wait(pool),
            ReclaimerState::Reclaiming => {
                reclaim::reclaim_pages(pool);
                ReclaimerState::Waiting
            }
            ReclaimerState::Stopped => break,
        };
    }
    debug!("reclaimer task stopped");
}

/// Park until stop is requested or the high watermark holds. The predicate
/// is re-checked after every wakeup.
fn wait(pool: &EpcPool) -> ReclaimerState {
    let waitq = pool.waitq();
    let mut guard = waitq.lock.lock().unwrap();
    loop {
        if waitq.stop_requested() {
            return ReclaimerState::Stopped;
        }
        if pool.should_reclaim(pool.config().nr_high_pages) {
            return ReclaimerState::Reclaiming;
        }
        guard = waitq.cond.wait(guard).unwrap();
    }
}
