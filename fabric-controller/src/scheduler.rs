//
// Copyright (c) The Fabric Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::time::Duration;

use fabric_utils::UnboundedSender;
use fabric_utils::task::TimeoutTask;

use crate::debug::Debug;
use crate::error::Error;
use crate::nib::Nib;
use crate::policy::Policy;
use crate::southbound::Southbound;
use crate::tasks;
use crate::tasks::messages::input::TimerMsg;

// Coalesces bursts of NIB changes into a single policy push.
//
// At most one update is scheduled at any time. Changes made while an update
// is scheduled are picked up when it fires, since the policy is synthesized
// from the NIB contents at that point.
#[derive(Debug)]
pub struct UpdateScheduler {
    delay: Duration,
    timer: Option<TimeoutTask>,
    timer_tx: UnboundedSender<TimerMsg>,
}

// ===== impl UpdateScheduler =====

impl UpdateScheduler {
    pub fn new(
        delay: Duration,
        timer_tx: UnboundedSender<TimerMsg>,
    ) -> UpdateScheduler {
        UpdateScheduler {
            delay,
            timer: None,
            timer_tx,
        }
    }

    // Schedules an update if the NIB changed and none is pending.
    pub fn notify(&mut self, nib: &Nib) {
        if !nib.is_dirty() || self.timer.is_some() {
            return;
        }
        Debug::PolicyUpdateSchedule(self.delay).log();
        self.timer = Some(tasks::update_timeout(self.delay, &self.timer_tx));
    }

    // Regenerates and installs the policy. On failure the NIB stays dirty and
    // another attempt is scheduled.
    pub fn fire<F>(
        &mut self,
        nib: &mut Nib,
        southbound: &mut impl Southbound,
        synthesize: F,
    ) where
        F: FnOnce(&Nib) -> Policy,
    {
        self.timer = None;
        if !nib.is_dirty() {
            return;
        }

        let policy = synthesize(nib);
        Debug::PolicyInstall(policy.rule_count()).log();
        match southbound.install_policy(&policy) {
            Ok(()) => nib.clear_dirty(),
            Err(error) => {
                Error::from(error).log();
                self.notify(nib);
            }
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.timer.is_some()
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.timer.as_ref().map(|timer| timer.remaining())
    }
}
