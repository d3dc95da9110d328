/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use crate::device::ResetStatus;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ContextLostStatus {
    Intact,
    Lost,
    LostBuffersFreed,
    CallbackNotified,
}

pub type ContextLostCallback = Box<dyn FnMut() + Send>;

/// Walks a lost context through cleanup and notification. Loss can be
/// noticed from many call sites; each step runs at most once.
pub struct ContextLossTracker {
    status: ContextLostStatus,
    reason: ResetStatus,
    callback: Option<ContextLostCallback>,
}

impl ContextLossTracker {
    pub fn new() -> ContextLossTracker {
        ContextLossTracker {
            status: ContextLostStatus::Intact,
            reason: ResetStatus::NoError,
            callback: None,
        }
    }

    pub fn status(&self) -> ContextLostStatus {
        self.status
    }

    pub fn is_intact(&self) -> bool {
        self.status == ContextLostStatus::Intact
    }

    pub fn reason(&self) -> ResetStatus {
        self.reason
    }

    pub fn set_callback(&mut self, callback: ContextLostCallback) {
        self.callback = Some(callback);
    }

    /// Records a reset reported by the driver. Returns true if this was the
    /// first report.
    pub fn mark_lost(&mut self, reason: ResetStatus) -> bool {
        if reason == ResetStatus::NoError || self.status != ContextLostStatus::Intact {
            return false;
        }
        warn!("graphics context lost ({:?})", reason);
        self.status = ContextLostStatus::Lost;
        self.reason = reason;
        true
    }

    pub fn handle_context_loss_if_needed<F: FnOnce()>(&mut self, free_buffers: F) {
        debug_assert!(self.status != ContextLostStatus::Intact);

        if self.status < ContextLostStatus::LostBuffersFreed {
            free_buffers();
            self.status = ContextLostStatus::LostBuffersFreed;
        }

        if self.status < ContextLostStatus::CallbackNotified {
            if let Some(ref mut callback) = self.callback {
                callback();
                self.status = ContextLostStatus::CallbackNotified;
            }
        }
    }

    /// Called once a replacement context is current. Keeps the callback.
    pub fn recover(&mut self) {
        if self.status >= ContextLostStatus::LostBuffersFreed {
            info!("graphics context recovered");
            self.status = ContextLostStatus::Intact;
            self.reason = ResetStatus::NoError;
        }
    }
}
