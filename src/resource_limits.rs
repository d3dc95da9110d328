/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Process-wide admission control for memory, graphics memory and file
//! descriptors, plus the policy for reclaiming graphics memory from idle
//! contexts.

use crate::device::ResetStatus;
use crate::options::RendererOptions;
use crate::util::lock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResourceContext {
    NoContext,
    WebContent,
    System,
}

pub struct ResourceLimits {
    memory_budget: Option<usize>,
    memory_usage: AtomicUsize,
    graphics_memory_limit: usize,
    graphics_memory_usage: AtomicUsize,
    file_descriptor_limit: usize,
    acquired_file_descriptors: Mutex<usize>,
}

impl ResourceLimits {
    pub fn new(options: &RendererOptions) -> ResourceLimits {
        ResourceLimits::with_file_descriptor_limit(options, soft_file_descriptor_limit())
    }

    pub fn with_file_descriptor_limit(options: &RendererOptions, limit: usize) -> ResourceLimits {
        ResourceLimits {
            memory_budget: options.memory_budget,
            memory_usage: AtomicUsize::new(0),
            graphics_memory_limit: options.graphics_memory_limit,
            graphics_memory_usage: AtomicUsize::new(0),
            file_descriptor_limit: limit,
            acquired_file_descriptors: Mutex::new(0),
        }
    }

    pub fn can_satisfy_memory_allocation(&self, bytes: usize) -> bool {
        if bytes == 0 {
            return true;
        }
        match self.memory_budget {
            Some(budget) => {
                let used = self.memory_usage.load(Ordering::SeqCst);
                used.checked_add(bytes).map_or(false, |total| total <= budget)
            }
            None => true,
        }
    }

    pub fn add_memory_usage(&self, bytes: usize) {
        self.memory_usage.fetch_add(bytes, Ordering::SeqCst);
    }

    pub fn remove_memory_usage(&self, bytes: usize) {
        self.memory_usage.fetch_sub(bytes, Ordering::SeqCst);
    }

    pub fn can_satisfy_graphics_memory_allocation(&self, bytes: usize) -> bool {
        let used = self.graphics_memory_usage.load(Ordering::SeqCst);
        used.checked_add(bytes).map_or(false, |total| total <= self.graphics_memory_limit)
    }

    pub fn graphics_memory_usage(&self) -> usize {
        self.graphics_memory_usage.load(Ordering::SeqCst)
    }

    pub fn add_graphics_memory_usage(&self, bytes: usize) {
        self.graphics_memory_usage.fetch_add(bytes, Ordering::SeqCst);
    }

    pub fn remove_graphics_memory_usage(&self, bytes: usize) {
        self.graphics_memory_usage.fetch_sub(bytes, Ordering::SeqCst);
    }

    /// Reserves `amount` descriptors for the lifetime of the returned grant.
    /// Web content always leaves half of the process limit untouched, since
    /// the descriptors it shares the process with cannot be counted.
    pub fn grant_file_descriptors(self: &Arc<Self>,
                                  context: ResourceContext,
                                  amount: usize)
                                  -> Option<FileDescriptorGrant> {
        debug_assert!(amount > 0);
        let reserve = match context {
            ResourceContext::WebContent => self.file_descriptor_limit / 2,
            ResourceContext::NoContext | ResourceContext::System => 0,
        };

        let mut acquired = lock(self.acquired_file_descriptors.lock());
        if self.file_descriptor_limit < *acquired + reserve + amount {
            debug!("denied {} file descriptors ({} acquired, limit {})",
                   amount, *acquired, self.file_descriptor_limit);
            return None;
        }
        *acquired += amount;

        Some(FileDescriptorGrant {
            limits: Arc::clone(self),
            amount,
        })
    }

    pub fn acquired_file_descriptors(&self) -> usize {
        *lock(self.acquired_file_descriptors.lock())
    }
}

#[cfg(unix)]
fn soft_file_descriptor_limit() -> usize {
    let mut limit = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        warn!("getrlimit(RLIMIT_NOFILE) failed, granting no file descriptors");
        return 0;
    }
    limit.rlim_cur as usize
}

#[cfg(not(unix))]
fn soft_file_descriptor_limit() -> usize {
    1024
}

pub struct FileDescriptorGrant {
    limits: Arc<ResourceLimits>,
    amount: usize,
}

impl FileDescriptorGrant {
    pub fn amount(&self) -> usize {
        self.amount
    }
}

impl Drop for FileDescriptorGrant {
    fn drop(&mut self) {
        let mut acquired = lock(self.limits.acquired_file_descriptors.lock());
        debug_assert!(*acquired >= self.amount);
        *acquired -= self.amount;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ContextId(pub u64);

/// A graphics context that can be torn down to give its memory back.
pub trait ResettableContext: Send + Sync {
    fn force_reset(&self, reason: ResetStatus);
    /// Blocks until the context's pending work has completed.
    fn finish(&self);
}

struct ContextEntry {
    id: ContextId,
    context: Weak<dyn ResettableContext>,
}

#[derive(Default)]
struct KillerLists {
    foreground: Vec<ContextEntry>,
    background: Vec<ContextEntry>,
}

impl KillerLists {
    fn remove(&mut self, id: ContextId) {
        self.background.retain(|entry| entry.id != id);
        self.foreground.retain(|entry| entry.id != id);
    }
}

/// Tracks live contexts in least-recently-used order, split by whether they
/// are currently visible.
#[derive(Default)]
pub struct GraphicsContextLowMemoryKiller {
    lists: Mutex<KillerLists>,
}

impl GraphicsContextLowMemoryKiller {
    pub fn new() -> GraphicsContextLowMemoryKiller {
        GraphicsContextLowMemoryKiller::default()
    }

    pub fn set_context_in_foreground(&self, id: ContextId, context: Weak<dyn ResettableContext>) {
        let mut lists = lock(self.lists.lock());
        lists.remove(id);
        lists.foreground.push(ContextEntry { id, context });
    }

    pub fn set_context_in_background(&self, id: ContextId, context: Weak<dyn ResettableContext>) {
        let mut lists = lock(self.lists.lock());
        lists.remove(id);
        lists.background.push(ContextEntry { id, context });
    }

    pub fn context_destroyed(&self, id: ContextId) {
        lock(self.lists.lock()).remove(id);
    }

    /// Resets the least recently used background context, or the oldest
    /// foreground context if nothing is in the background.
    pub fn reset_lru_context(&self) -> Option<ContextId> {
        let (entry, reason) = {
            let mut lists = lock(self.lists.lock());
            if !lists.background.is_empty() {
                (lists.background.remove(0), ResetStatus::Innocent)
            } else if !lists.foreground.is_empty() {
                (lists.foreground.remove(0), ResetStatus::Guilty)
            } else {
                return None;
            }
        };

        debug!("resetting context {:?} ({:?}) due to high graphics memory usage", entry.id, reason);
        if let Some(context) = entry.context.upgrade() {
            context.force_reset(reason);
            context.finish();
        }
        Some(entry.id)
    }

    /// Resets other contexts until `bytes` of graphics memory fit, or nothing
    /// is left to reset. Stops when the requester itself was picked.
    pub fn ensure_enough_graphics_memory(&self,
                                         limits: &ResourceLimits,
                                         requester: ContextId,
                                         bytes: usize)
                                         -> bool {
        loop {
            if limits.can_satisfy_graphics_memory_allocation(bytes) {
                return true;
            }
            match self.reset_lru_context() {
                Some(id) if id != requester => continue,
                _ => return false,
            }
        }
    }
}
