/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Buffers handed between a producer and the compositor.
//!
//! An `ImageBuffer` has a unique owner at any time. Readers that need the
//! pixels while the owner keeps moving it around take the surface lock,
//! which also keeps the buffer from being deleted underneath them.

use crate::device::{Device, TextureId};
use crate::util::lock;
use euclid::Size2D;
use std::sync::{Arc, Condvar, Mutex};

pub struct PixelView<'a> {
    pub pixels: &'a [u8],
    pub size: Size2D<i32>,
    pub stride: usize,
}

pub struct PixelViewMut<'a> {
    pub pixels: &'a mut [u8],
    pub size: Size2D<i32>,
    pub stride: usize,
}

/// Completion marker for GPU work touching a buffer.
#[derive(Debug, Default)]
pub struct Fence {
    pending: bool,
}

impl Fence {
    pub fn set(&mut self) {
        self.pending = true;
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Waits for the fenced work. Commands are issued synchronously here, so
    /// there is nothing left to wait for once the call returns.
    pub fn finish(&mut self) {
        self.pending = false;
    }

    pub fn clear(&mut self) {
        self.pending = false;
    }
}

/// The storage behind an `ImageBuffer`.
pub trait BufferSource: Send {
    fn size(&self) -> Size2D<i32>;

    /// Waits for outstanding GPU work on this buffer.
    fn finish(&mut self);
    fn set_fence(&mut self);

    /// False once the context that produced the contents was reset.
    fn is_intact(&self) -> bool {
        true
    }

    fn lock_for_reading(&mut self, premultiply_alpha: bool) -> Option<PixelView>;

    /// Sources written only by the GPU have no CPU mapping to hand out.
    fn lock_for_writing(&mut self) -> Option<PixelViewMut> {
        None
    }

    fn unlock(&mut self);

    fn lock_for_gl_reading(&mut self, device: &mut dyn Device) -> Option<TextureId>;
    fn unlock_gl(&mut self, device: &mut dyn Device, texture: TextureId);

    fn delete_buffer_source(&mut self);
}

pub(crate) struct BufferCell {
    surface_locked: Mutex<bool>,
    surface_unlocked: Condvar,
    source: Mutex<Box<dyn BufferSource>>,
}

impl BufferCell {
    pub fn lock_surface(&self) {
        let mut locked = lock(self.surface_locked.lock());
        while *locked {
            locked = lock(self.surface_unlocked.wait(locked));
        }
        *locked = true;
    }

    pub fn unlock_surface(&self) {
        *lock(self.surface_locked.lock()) = false;
        self.surface_unlocked.notify_one();
    }

    pub fn with_source<R, F: FnOnce(&mut dyn BufferSource) -> R>(&self, f: F) -> R {
        let mut source = lock(self.source.lock());
        f(&mut **source)
    }
}

pub struct ImageBuffer {
    cell: Arc<BufferCell>,
}

impl ImageBuffer {
    pub fn new(source: Box<dyn BufferSource>) -> ImageBuffer {
        ImageBuffer {
            cell: Arc::new(BufferCell {
                surface_locked: Mutex::new(false),
                surface_unlocked: Condvar::new(),
                source: Mutex::new(source),
            }),
        }
    }

    pub fn is_same(&self, other: &ImageBuffer) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    pub fn lock_surface(&self) {
        self.cell.lock_surface();
    }

    pub fn unlock_surface(&self) {
        self.cell.unlock_surface();
    }

    /// Must be called with the surface locked.
    pub fn finish(&self) {
        self.cell.with_source(|source| source.finish());
    }

    /// Must be called with the surface locked.
    pub fn set_fence(&self) {
        self.cell.with_source(|source| source.set_fence());
    }

    pub fn is_intact(&self) -> bool {
        self.cell.with_source(|source| source.is_intact())
    }

    pub fn size(&self) -> Size2D<i32> {
        self.cell.with_source(|source| source.size())
    }

    pub fn with_source<R, F: FnOnce(&mut dyn BufferSource) -> R>(&self, f: F) -> R {
        self.cell.with_source(f)
    }

    pub(crate) fn share(&self) -> Arc<BufferCell> {
        Arc::clone(&self.cell)
    }
}

impl Drop for ImageBuffer {
    fn drop(&mut self) {
        // Readers holding the surface lock finish before the storage goes.
        self.cell.lock_surface();
        self.cell.with_source(|source| source.delete_buffer_source());
        self.cell.unlock_surface();
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// An in-memory source whose fence and intactness are controlled by the
    /// test.
    pub struct TestSource {
        pub pixels: Vec<u8>,
        pub intact: Arc<AtomicBool>,
        pub finishes: Arc<AtomicUsize>,
        pub deleted: Arc<AtomicBool>,
        pub fence: Fence,
    }

    impl TestSource {
        pub fn buffer() -> (ImageBuffer, Arc<AtomicBool>, Arc<AtomicBool>) {
            crate::recording_device::init_test_logging();
            let intact = Arc::new(AtomicBool::new(true));
            let deleted = Arc::new(AtomicBool::new(false));
            let source = TestSource {
                pixels: vec![0; 4],
                intact: Arc::clone(&intact),
                finishes: Arc::new(AtomicUsize::new(0)),
                deleted: Arc::clone(&deleted),
                fence: Fence::default(),
            };
            (ImageBuffer::new(Box::new(source)), intact, deleted)
        }
    }

    impl BufferSource for TestSource {
        fn size(&self) -> Size2D<i32> {
            Size2D::new(1, 1)
        }

        fn finish(&mut self) {
            self.finishes.fetch_add(1, Ordering::SeqCst);
            self.fence.finish();
        }

        fn set_fence(&mut self) {
            self.fence.set();
        }

        fn is_intact(&self) -> bool {
            self.intact.load(Ordering::SeqCst)
        }

        fn lock_for_reading(&mut self, _premultiply_alpha: bool) -> Option<PixelView> {
            Some(PixelView { pixels: &self.pixels, size: Size2D::new(1, 1), stride: 4 })
        }

        fn unlock(&mut self) {}

        fn lock_for_gl_reading(&mut self, device: &mut dyn Device) -> Option<TextureId> {
            Some(device.create_texture())
        }

        fn unlock_gl(&mut self, device: &mut dyn Device, texture: TextureId) {
            device.delete_texture(texture);
        }

        fn delete_buffer_source(&mut self) {
            self.deleted.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn dropping_deletes_the_source() {
        let (buffer, _, deleted) = TestSource::buffer();
        let shared = buffer.share();
        drop(buffer);
        assert!(deleted.load(Ordering::SeqCst));
        shared.lock_surface();
        shared.unlock_surface();
    }
}
