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

use crate::cpumask::CpuMask;

/// State of one enclave's translation tracking cycle.
///
/// A write-back is safe only once every processor that might hold a stale
/// translation to a blocked page has left the enclave at least once since
/// the epoch was bumped.
#[derive(Debug)]
pub(crate) struct TrackingState {
    /// Bumped by every activation; processors entering the enclave afterwards
    /// observe the fresh epoch and need no forced exit.
    epoch: u64,
    /// Indicates if a tracking cycle is active.
    tracking: bool,
    /// Indicates if there may exist stale translations for a blocked page.
    write_back_done: bool,
    /// The number of logical processors currently executing enclave code.
    active_threads: u16,
    /// The number of logical processors that were executing enclave code when
    /// the cycle was activated.
    tracked_threads: u16,
    /// Processors that have exited the enclave since the cycle was activated.
    lp_mask: CpuMask,
}

impl TrackingState {
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn active_thread_num(&self) -> u16 {
        self.active_threads
    }

    pub(crate) fn is_in_tracking(&self) -> bool {
        self.tracking
    }

    pub(crate) fn is_write_back_done(&self) -> bool {
        self.write_back_done
    }

    /// Blocking a page invalidates any previously completed cycle.
    pub(crate) fn require_track_for_write_back(&mut self) {
        self.tracking = false;
        self.write_back_done = false;
    }

    /// Start a tracking cycle. With no processor inside the enclave the
    /// cycle completes immediately.
    pub(crate) fn activate(&mut self) -> bool {
        if self.tracking {
            return false;
        }
        self.epoch += 1;
        if self.active_threads == 0 {
            self.write_back_done = true;
            return true;
        }
        self.tracking = true;
        self.tracked_threads = self.active_threads;
        self.lp_mask.clear();

        true
    }

    pub(crate) fn update(&mut self, is_enter: bool, cpuid: usize) {
        if is_enter {
            self.active_threads += 1;

            if self.is_in_tracking() {
                // Entered after the epoch bump; its exit must not count.
                self.lp_mask.set_cpu(cpuid);
            }
        } else {
            self.active_threads -= 1;

            if self.is_in_tracking() && !self.lp_mask.test_cpu(cpuid) {
                self.lp_mask.set_cpu(cpuid);
                self.tracked_threads -= 1;
                if self.tracked_threads == 0 {
                    self.write_back_done = true;
                    self.tracking = false;
                }
            }
        }
    }
}

impl Default for TrackingState {
    fn default() -> Self {
        Self {
            epoch: 0,
            tracking: false,
            // There are no stale translations in the init state.
            write_back_done: true,
            active_threads: 0,
            tracked_threads: 0,
            lp_mask: CpuMask::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_enclave_tracks_immediately() {
        let mut state = TrackingState::default();
        state.require_track_for_write_back();
        assert!(!state.is_write_back_done());
        assert!(state.activate());
        assert!(state.is_write_back_done());
        assert!(!state.is_in_tracking());
        assert_eq!(state.epoch(), 1);
    }

    #[test]
    fn straggler_exit_completes_cycle() {
        let mut state = TrackingState::default();
        state.update(true, 3);
        state.update(true, 7);
        state.require_track_for_write_back();
        assert!(state.activate());
        assert!(state.is_in_tracking());
        assert!(!state.is_write_back_done());

        state.update(false, 3);
        assert!(!state.is_write_back_done());
        state.update(false, 7);
        assert!(state.is_write_back_done());
        assert!(!state.is_in_tracking());
    }

    #[test]
    fn entrant_after_activation_does_not_count() {
        let mut state = TrackingState::default();
        state.update(true, 1);
        state.require_track_for_write_back();
        assert!(state.activate());

        // CPU 2 enters with the fresh epoch; its exit must not complete the
        // cycle on behalf of CPU 1.
        state.update(true, 2);
        state.update(false, 2);
        assert!(!state.is_write_back_done());

        state.update(false, 1);
        assert!(state.is_write_back_done());
    }

    #[test]
    fn reentry_counted_once() {
        let mut state = TrackingState::default();
        state.update(true, 5);
        state.require_track_for_write_back();
        assert!(state.activate());
        assert!(!state.activate());

        state.update(false, 5);
        state.update(true, 5);
        state.update(false, 5);
        assert!(state.is_write_back_done());
        assert_eq!(state.active_thread_num(), 0);
    }
}
