/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Producer/consumer hand-off of GPU buffers.
//!
//! The producer takes a free buffer, renders into it and submits it. A
//! helper thread waits for the buffer's fence and then stages it; the
//! consumer commits the staged buffer to the front. At most four buffers
//! are in flight: front, staged, fence-wait and two free ones, with the
//! fence-wait slot gating `take_free_buffer`.

use crate::device::{Device, TextureId};
use crate::image_buffer::{BufferCell, ImageBuffer, PixelView};
use crate::util::lock;
use std::mem;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

pub trait RingClient: Send + Sync {
    /// Called on the fence thread once a new buffer is staged. Returning
    /// false defers the commit to an explicit `commit_staged_buffer`.
    fn on_new_front_buffer_ready(&self) -> bool;
}

enum FenceWaitSlot {
    Empty,
    Queued(ImageBuffer),
    /// The fence thread has taken the buffer and is waiting on it.
    Waiting,
}

impl FenceWaitSlot {
    fn is_occupied(&self) -> bool {
        match *self {
            FenceWaitSlot::Empty => false,
            FenceWaitSlot::Queued(_) | FenceWaitSlot::Waiting => true,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum FenceThreadStatus {
    NotCreated,
    Created,
    FailedToCreate,
}

struct RingState {
    front: Option<ImageBuffer>,
    staged: Option<ImageBuffer>,
    fence_wait: FenceWaitSlot,
    free: [Option<ImageBuffer>; 2],
    thread_status: FenceThreadStatus,
    exit_requested: bool,
}

impl RingState {
    fn rotate_buffers(&mut self) -> Option<ImageBuffer> {
        debug_assert!(self.staged.is_some() && self.free[1].is_none());
        let evicted = self.free[1].take();
        self.free[1] = self.free[0].take();
        self.free[0] = self.front.take();
        self.front = self.staged.take();
        evicted
    }
}

struct RingShared {
    state: Mutex<RingState>,
    staged_buffer_cleared: Condvar,
    fence_wait_buffer_cleared: Condvar,
    fence_wait_thread_ready: Condvar,
    client: Mutex<Option<Arc<dyn RingClient>>>,
}

impl RingShared {
    fn wait_for_fence_wait_buffer<'a>(&self, mut state: MutexGuard<'a, RingState>)
                                      -> MutexGuard<'a, RingState> {
        while state.fence_wait.is_occupied() {
            state = lock(self.fence_wait_buffer_cleared.wait(state));
        }
        state
    }

    fn commit_staged_buffer(&self) {
        let mut state = lock(self.state.lock());
        if state.staged.is_none() {
            return;
        }
        state.rotate_buffers();
        self.staged_buffer_cleared.notify_one();
    }

    fn run_fence_wait_thread(&self) {
        loop {
            let buffer = {
                let mut state = lock(self.state.lock());
                loop {
                    if state.exit_requested {
                        return;
                    }
                    if let FenceWaitSlot::Queued(_) = state.fence_wait {
                        break;
                    }
                    state = lock(self.fence_wait_thread_ready.wait(state));
                }
                match mem::replace(&mut state.fence_wait, FenceWaitSlot::Waiting) {
                    FenceWaitSlot::Queued(buffer) => buffer,
                    FenceWaitSlot::Empty | FenceWaitSlot::Waiting => continue,
                }
            };

            buffer.lock_surface();
            buffer.finish();
            buffer.unlock_surface();

            {
                let mut state = lock(self.state.lock());
                if buffer.is_intact() {
                    while state.staged.is_some() {
                        state = lock(self.staged_buffer_cleared.wait(state));
                    }
                    state.staged = Some(buffer);
                } else {
                    debug!("dropping a buffer rendered by a lost context");
                    drop(buffer);
                }
                state.fence_wait = FenceWaitSlot::Empty;
            }
            self.fence_wait_buffer_cleared.notify_all();

            let client = lock(self.client.lock());
            let commit = match *client {
                Some(ref client) => client.on_new_front_buffer_ready(),
                None => true,
            };
            if commit {
                self.commit_staged_buffer();
            }
        }
    }
}

/// Exclusive access to the front buffer. Other ring operations block until
/// the guard is given back with `submit_front_buffer_and_unlock`.
pub struct FrontBufferGuard<'a> {
    state: MutexGuard<'a, RingState>,
    buffer: Option<ImageBuffer>,
}

impl<'a> FrontBufferGuard<'a> {
    pub fn buffer(&self) -> Option<&ImageBuffer> {
        self.buffer.as_ref()
    }

    pub fn take(&mut self) -> Option<ImageBuffer> {
        self.buffer.take()
    }

    pub fn replace(&mut self, buffer: Option<ImageBuffer>) {
        self.buffer = buffer;
    }
}

/// A front buffer locked for GL reads; hand it back with
/// `BufferRing::unlock_front_buffer_gl`.
pub struct LockedFrontBuffer {
    cell: Arc<BufferCell>,
    texture: TextureId,
}

impl LockedFrontBuffer {
    pub fn texture(&self) -> TextureId {
        self.texture
    }
}

pub struct BufferRing {
    shared: Arc<RingShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl BufferRing {
    pub fn new() -> BufferRing {
        BufferRing {
            shared: Arc::new(RingShared {
                state: Mutex::new(RingState {
                    front: None,
                    staged: None,
                    fence_wait: FenceWaitSlot::Empty,
                    free: [None, None],
                    thread_status: FenceThreadStatus::NotCreated,
                    exit_requested: false,
                }),
                staged_buffer_cleared: Condvar::new(),
                fence_wait_buffer_cleared: Condvar::new(),
                fence_wait_thread_ready: Condvar::new(),
                client: Mutex::new(None),
            }),
            thread: Mutex::new(None),
        }
    }

    pub fn set_client(&self, client: Option<Arc<dyn RingClient>>) {
        *lock(self.shared.client.lock()) = client;
    }

    /// Returns a buffer for the producer to render into, or `None` if it has
    /// to allocate one. Waits for the previously submitted buffer to leave
    /// the fence-wait slot so no more than four buffers ever exist.
    pub fn take_free_buffer(&self) -> Option<ImageBuffer> {
        let state = lock(self.shared.state.lock());
        let mut state = self.shared.wait_for_fence_wait_buffer(state);
        if state.free[1].is_some() {
            return state.free[1].take();
        }
        state.free[0].take()
    }

    pub fn submit_buffer(&self, buffer: ImageBuffer) {
        let mut state = lock(self.shared.state.lock());

        if state.thread_status == FenceThreadStatus::NotCreated {
            let shared = Arc::clone(&self.shared);
            let spawned = thread::Builder::new()
                .name("FenceWait".to_owned())
                .spawn(move || shared.run_fence_wait_thread());
            match spawned {
                Ok(handle) => {
                    *lock(self.thread.lock()) = Some(handle);
                    state.thread_status = FenceThreadStatus::Created;
                }
                Err(e) => {
                    error!("Failed to create a thread to wait on buffer fences ({}). \
                            Falling back on triple buffering.", e);
                    state.thread_status = FenceThreadStatus::FailedToCreate;
                }
            }
        }

        if state.thread_status == FenceThreadStatus::FailedToCreate {
            debug_assert!(state.free[1].is_none() && state.staged.is_none());
            let old_front = state.front.take();
            state.free[0] = old_front;
            state.front = Some(buffer);
            return;
        }

        assert!(!state.fence_wait.is_occupied(), "submitted without taking a free buffer");
        state.fence_wait = FenceWaitSlot::Queued(buffer);
        self.shared.fence_wait_thread_ready.notify_one();
    }

    pub fn commit_staged_buffer(&self) {
        self.shared.commit_staged_buffer();
    }

    /// Takes the front buffer for exclusive use, first promoting any staged
    /// buffer. Waits for the fence-wait slot to drain so a pending promotion
    /// cannot race the caller.
    pub fn take_front_buffer_and_lock(&self) -> FrontBufferGuard {
        let state = lock(self.shared.state.lock());
        let mut state = self.shared.wait_for_fence_wait_buffer(state);
        if state.staged.is_some() {
            state.rotate_buffers();
            self.shared.staged_buffer_cleared.notify_one();
        }
        let buffer = state.front.take();
        FrontBufferGuard { state, buffer }
    }

    pub fn submit_front_buffer_and_unlock(&self, mut guard: FrontBufferGuard) {
        debug_assert!(guard.state.front.is_none() && guard.state.staged.is_none());
        guard.state.front = guard.buffer.take();
    }

    /// Drops the free buffers, and the front one too if a newer buffer is
    /// staged behind it.
    pub fn delete_free_buffers(&self) {
        let state = lock(self.shared.state.lock());
        let mut state = self.shared.wait_for_fence_wait_buffer(state);
        state.free = [None, None];
        if state.staged.is_some() {
            state.front = state.staged.take();
            self.shared.staged_buffer_cleared.notify_one();
        }
    }

    pub fn delete_all_buffers(&self) {
        let state = lock(self.shared.state.lock());
        let mut state = self.shared.wait_for_fence_wait_buffer(state);
        state.free = [None, None];
        state.staged = None;
        state.front = None;
        self.shared.staged_buffer_cleared.notify_one();
    }

    pub fn has_front_buffer(&self) -> bool {
        lock(self.shared.state.lock()).front.is_some()
    }

    fn front_cell(&self) -> Option<Arc<BufferCell>> {
        let state = lock(self.shared.state.lock());
        let cell = state.front.as_ref()?.share();
        cell.lock_surface();
        Some(cell)
    }

    /// Runs `f` over the front buffer's pixels.
    pub fn read_front_buffer<R, F>(&self, premultiply_alpha: bool, f: F) -> Option<R>
        where F: FnOnce(PixelView) -> R
    {
        let cell = self.front_cell()?;
        let result = cell.with_source(|source| {
            source.finish();
            let result = source.lock_for_reading(premultiply_alpha).map(f);
            if result.is_some() {
                source.unlock();
            }
            result
        });
        cell.unlock_surface();
        result
    }

    /// Locks the front buffer for drawing. The buffer stays locked, and thus
    /// alive, until `unlock_front_buffer_gl`.
    pub fn lock_front_buffer_for_reading_gl(&self, device: &mut dyn Device)
                                            -> Option<LockedFrontBuffer> {
        let cell = self.front_cell()?;
        let texture = cell.with_source(|source| {
            source.finish();
            source.lock_for_gl_reading(device)
        });
        match texture {
            Some(texture) => Some(LockedFrontBuffer { cell, texture }),
            None => {
                cell.unlock_surface();
                None
            }
        }
    }

    pub fn unlock_front_buffer_gl(&self, locked: LockedFrontBuffer, device: &mut dyn Device) {
        locked.cell.with_source(|source| {
            source.unlock_gl(device, locked.texture);
            source.set_fence();
        });
        locked.cell.unlock_surface();
    }

    #[cfg(test)]
    fn buffer_count(&self) -> usize {
        let state = lock(self.shared.state.lock());
        let slots = [&state.front, &state.staged, &state.free[0], &state.free[1]];
        let mut count = slots.iter().filter(|s| s.is_some()).count();
        if state.fence_wait.is_occupied() {
            count += 1;
        }
        let present: Vec<&ImageBuffer> = slots.iter().filter_map(|s| s.as_ref()).collect();
        for (i, a) in present.iter().enumerate() {
            for b in &present[i + 1 ..] {
                assert!(!a.is_same(b), "one buffer in two roles");
            }
        }
        count
    }
}

impl Drop for BufferRing {
    fn drop(&mut self) {
        let handle = lock(self.thread.lock()).take();
        if let Some(handle) = handle {
            lock(self.shared.state.lock()).exit_requested = true;
            self.shared.fence_wait_thread_ready.notify_all();
            let _ = handle.join();
        }
    }
}
