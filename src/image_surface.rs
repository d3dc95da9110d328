/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Surfaces with a front/back buffer pair, and the registry that turns
//! quad buffering off for all of them when their combined size would cost
//! too much memory.

use crate::buffer_ring::{BufferRing, RingClient};
use crate::device::{Device, TextureFilter, TextureTarget};
use crate::draw_quad_data::{ContentFlags, DrawQuadData, DrawQuadType, TextureQuadData};
use crate::image_buffer::{ImageBuffer, PixelViewMut};
use crate::mapped_texture::{MappedTexture, PixelFormat, WriteMode};
use crate::resource_limits::{ResourceContext, ResourceLimits};
use crate::shader_program::ShaderProgram;
use crate::util::{lock, FloatRect, Matrix};
use euclid::{Rect, Size2D};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

pub trait ImageSurface: Send + Sync {
    fn size(&self) -> Size2D<i32>;
    fn buffer_ring(&self) -> &BufferRing;

    fn is_inverted(&self) -> bool {
        false
    }

    fn has_alpha(&self) -> bool {
        true
    }

    fn has_premultiplied_alpha(&self) -> bool {
        true
    }

    fn swap_buffers(&self);

    fn supports_quad_buffering(&self) -> bool {
        false
    }

    fn submit_back_buffer(&self) {}
    fn delete_free_buffers(&self) {}
    fn update_background_status(&self, _in_background: bool) {}
    fn did_detach_from_view(&self) {}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SurfaceId(usize);

struct RegisteredSurface {
    id: SurfaceId,
    size: Size2D<i32>,
    surface: Weak<dyn ImageSurface>,
}

pub struct ImageSurfaceRegistry {
    surfaces: Mutex<Vec<RegisteredSurface>>,
    quad_buffering_disabled: AtomicBool,
    max_combined_area: u64,
    next_id: AtomicUsize,
}

impl ImageSurfaceRegistry {
    pub fn new(max_combined_area: u64) -> ImageSurfaceRegistry {
        ImageSurfaceRegistry {
            surfaces: Mutex::new(Vec::new()),
            quad_buffering_disabled: AtomicBool::new(false),
            max_combined_area,
            next_id: AtomicUsize::new(1),
        }
    }

    pub fn is_quad_buffering_disabled(&self) -> bool {
        self.quad_buffering_disabled.load(Ordering::SeqCst)
    }

    pub fn register(&self, surface: Weak<dyn ImageSurface>, size: Size2D<i32>) -> SurfaceId {
        let id = SurfaceId(self.next_id.fetch_add(1, Ordering::SeqCst));
        lock(self.surfaces.lock()).push(RegisteredSurface { id, size, surface });
        self.update_quad_buffering_state();
        id
    }

    pub fn unregister(&self, id: SurfaceId) {
        lock(self.surfaces.lock()).retain(|entry| entry.id != id);
        self.update_quad_buffering_state();
    }

    pub fn update_size(&self, id: SurfaceId, size: Size2D<i32>) {
        {
            let mut surfaces = lock(self.surfaces.lock());
            if let Some(entry) = surfaces.iter_mut().find(|entry| entry.id == id) {
                entry.size = size;
            }
        }
        self.update_quad_buffering_state();
    }

    fn update_quad_buffering_state(&self) {
        let to_trim: Vec<Arc<dyn ImageSurface>> = {
            let surfaces = lock(self.surfaces.lock());
            let total_area: u64 = surfaces
                .iter()
                .map(|entry| entry.size.width.max(0) as u64 * entry.size.height.max(0) as u64)
                .sum();
            let should_disable = total_area > self.max_combined_area;
            if self.quad_buffering_disabled.swap(should_disable, Ordering::SeqCst) == should_disable {
                return;
            }
            if !should_disable {
                info!("Resuming quad buffering");
                return;
            }
            info!("Disabling quad buffering to conserve memory");
            surfaces.iter().filter_map(|entry| entry.surface.upgrade()).collect()
        };

        for surface in to_trim {
            surface.delete_free_buffers();
        }
    }
}

/// The producer side of a surface painted in software: buffers cycle
/// through the ring, new ones are allocated only when the ring has none to
/// give back.
pub struct BufferedSurface {
    ring: Arc<BufferRing>,
    size: Mutex<Size2D<i32>>,
    has_alpha: bool,
    back_buffer: Mutex<Option<ImageBuffer>>,
    limits: Arc<ResourceLimits>,
    registry: Arc<ImageSurfaceRegistry>,
    id: Mutex<Option<SurfaceId>>,
}

impl BufferedSurface {
    pub fn new(registry: &Arc<ImageSurfaceRegistry>,
               limits: &Arc<ResourceLimits>,
               size: Size2D<i32>,
               has_alpha: bool)
               -> Arc<BufferedSurface> {
        let surface = Arc::new(BufferedSurface {
            ring: Arc::new(BufferRing::new()),
            size: Mutex::new(size),
            has_alpha,
            back_buffer: Mutex::new(None),
            limits: Arc::clone(limits),
            registry: Arc::clone(registry),
            id: Mutex::new(None),
        });
        let weak = Arc::downgrade(&surface) as Weak<dyn ImageSurface>;
        *lock(surface.id.lock()) = Some(registry.register(weak, size));
        surface
    }

    pub fn set_client(&self, client: Option<Arc<dyn RingClient>>) {
        self.ring.set_client(client);
    }

    pub fn resize(&self, size: Size2D<i32>) {
        *lock(self.size.lock()) = size;
        *lock(self.back_buffer.lock()) = None;
        self.ring.delete_all_buffers();
        if let Some(id) = *lock(self.id.lock()) {
            self.registry.update_size(id, size);
        }
    }

    fn allocate_buffer(&self) -> Option<ImageBuffer> {
        let size = *lock(self.size.lock());
        let format = if self.has_alpha { PixelFormat::HasAlpha } else { PixelFormat::NoAlpha };
        let texture = MappedTexture::new(&self.limits, ResourceContext::WebContent, size,
                                         format, WriteMode::SOFTWARE)?;
        Some(ImageBuffer::new(Box::new(texture)))
    }

    /// Paints the next frame into a back buffer. Returns false if no buffer
    /// could be found or allocated.
    pub fn paint<F: FnOnce(PixelViewMut)>(&self, paint: F) -> bool {
        let mut back = lock(self.back_buffer.lock());
        if back.is_none() {
            *back = match self.ring.take_free_buffer() {
                Some(buffer) if buffer.size() == *lock(self.size.lock()) => Some(buffer),
                _ => self.allocate_buffer(),
            };
        }
        let buffer = match *back {
            Some(ref buffer) => buffer,
            None => return false,
        };

        buffer.lock_surface();
        let painted = buffer.with_source(|source| {
            match source.lock_for_writing() {
                Some(view) => paint(view),
                None => return false,
            }
            source.unlock();
            true
        });
        buffer.unlock_surface();
        painted
    }

    /// Draws the current front buffer through the compositor.
    pub fn draw_gl(&self,
                   device: &mut dyn Device,
                   shader: &mut ShaderProgram,
                   geometry: &FloatRect,
                   transform: &Matrix,
                   opacity: f32) {
        let locked = match self.ring.lock_front_buffer_for_reading_gl(device) {
            Some(locked) => locked,
            None => return,
        };

        let mut flags = ContentFlags::CAN_DEFER_RENDERING;
        if !self.has_alpha() {
            flags |= ContentFlags::HAS_NO_ALPHA;
        }
        if !self.has_premultiplied_alpha() {
            flags |= ContentFlags::ALPHA_NOT_PREMULTIPLIED;
        }

        let mut geometry = *geometry;
        if self.is_inverted() {
            geometry = Rect::new(geometry.bottom_left(),
                                 Size2D::new(geometry.size.width, -geometry.size.height));
        }
        let data = TextureQuadData::new(
            DrawQuadData::new(DrawQuadType::Layer, Some(*transform), geometry, opacity),
            locked.texture(),
            TextureTarget::Default,
            TextureFilter::Linear,
            flags,
        );
        let ring = Arc::clone(&self.ring);
        shader.draw_texture_quad(device, &data, Some(Box::new(move |device: &mut dyn Device| {
            ring.unlock_front_buffer_gl(locked, device);
        })));
    }
}

impl ImageSurface for BufferedSurface {
    fn size(&self) -> Size2D<i32> {
        *lock(self.size.lock())
    }

    fn buffer_ring(&self) -> &BufferRing {
        &self.ring
    }

    fn has_alpha(&self) -> bool {
        self.has_alpha
    }

    fn swap_buffers(&self) {
        self.submit_back_buffer();
    }

    fn supports_quad_buffering(&self) -> bool {
        true
    }

    fn submit_back_buffer(&self) {
        let buffer = lock(self.back_buffer.lock()).take();
        if let Some(buffer) = buffer {
            self.ring.submit_buffer(buffer);
            if self.registry.is_quad_buffering_disabled() {
                self.ring.delete_free_buffers();
            }
        }
    }

    fn delete_free_buffers(&self) {
        self.ring.delete_free_buffers();
    }

    fn did_detach_from_view(&self) {
        *lock(self.back_buffer.lock()) = None;
        self.ring.delete_free_buffers();
    }
}

impl Drop for BufferedSurface {
    fn drop(&mut self) {
        if let Some(id) = lock(self.id.lock()).take() {
            self.registry.unregister(id);
        }
    }
}
