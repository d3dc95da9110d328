/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! A CPU-mappable pixel buffer that can also be sampled as a GL texture.
//!
//! Painting happens through the software mapping on whatever thread owns
//! the buffer; the compositor thread reads it through a texture. The
//! texture is refreshed from the mapping whenever software writes landed
//! since the last upload.

use crate::device::{Device, TextureFilter, TextureId, TextureTarget};
use crate::image_buffer::{BufferSource, Fence, PixelView, PixelViewMut};
use crate::resource_limits::{FileDescriptorGrant, ResourceContext, ResourceLimits};
use euclid::Size2D;
use std::sync::Arc;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PixelFormat {
    HasAlpha,
    NoAlpha,
}

bitflags! {
    pub struct WriteMode: u32 {
        const SOFTWARE = 1;
        const HARDWARE = 2;
    }
}

/// `color * (1 + alpha) >> 8` keeps zero alpha at zero and full alpha
/// unchanged without a divide.
pub fn copy_and_premultiply_alpha(source: &[u8], target: &mut [u8]) {
    for (src, dst) in source.chunks(4).zip(target.chunks_mut(4)) {
        if src.len() < 4 || dst.len() < 4 {
            break;
        }
        let one_plus_alpha = 1 + src[3] as u32;
        dst[0] = ((src[0] as u32 * one_plus_alpha) >> 8) as u8;
        dst[1] = ((src[1] as u32 * one_plus_alpha) >> 8) as u8;
        dst[2] = ((src[2] as u32 * one_plus_alpha) >> 8) as u8;
        dst[3] = src[3];
    }
}

pub struct MappedTexture {
    size: Size2D<i32>,
    format: PixelFormat,
    write_mode: WriteMode,
    pixels: Vec<u8>,
    premultiplied: Vec<u8>,
    stride: usize,
    mapped: bool,
    did_write_with_hardware: bool,
    is_locked_for_hardware_write: bool,
    hardware_write_fence: Fence,
    read_fence: Fence,
    content_generation: u64,
    uploaded: Option<(TextureId, u64)>,
    intact: bool,
    limits: Arc<ResourceLimits>,
    _file_descriptor_grant: FileDescriptorGrant,
}

impl MappedTexture {
    pub fn new(limits: &Arc<ResourceLimits>,
               context: ResourceContext,
               size: Size2D<i32>,
               format: PixelFormat,
               write_mode: WriteMode)
               -> Option<MappedTexture> {
        if size.width <= 0 || size.height <= 0 {
            return None;
        }
        let grant = limits.grant_file_descriptors(context, 1)?;
        let stride = size.width as usize * 4;
        let bytes = stride * size.height as usize;
        if !limits.can_satisfy_memory_allocation(bytes) {
            debug!("not enough memory for a {}x{} buffer", size.width, size.height);
            return None;
        }
        limits.add_memory_usage(bytes);

        let mut texture = MappedTexture {
            size,
            format,
            write_mode,
            pixels: vec![0; bytes],
            premultiplied: Vec::new(),
            stride,
            mapped: false,
            did_write_with_hardware: false,
            is_locked_for_hardware_write: false,
            hardware_write_fence: Fence::default(),
            read_fence: Fence::default(),
            content_generation: 0,
            uploaded: None,
            intact: true,
            limits: Arc::clone(limits),
            _file_descriptor_grant: grant,
        };

        if format == PixelFormat::NoAlpha {
            if let Some(view) = texture.lock_buffer_for_writing() {
                for pixel in view.pixels.chunks_mut(4) {
                    pixel[3] = 0xff;
                }
            }
            texture.unlock_buffer();
        }

        Some(texture)
    }

    pub fn size(&self) -> Size2D<i32> {
        self.size
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn write_mode(&self) -> WriteMode {
        self.write_mode
    }

    pub fn texture_target(&self) -> TextureTarget {
        TextureTarget::Default
    }

    fn map(&mut self) -> bool {
        debug_assert!(!self.mapped, "buffer mapped twice");
        if self.did_write_with_hardware {
            self.hardware_write_fence.finish();
            self.hardware_write_fence.clear();
            self.did_write_with_hardware = false;
        }
        self.mapped = true;
        true
    }

    pub fn lock_buffer_for_writing(&mut self) -> Option<PixelViewMut> {
        if !self.map() {
            return None;
        }
        self.content_generation += 1;
        Some(PixelViewMut {
            pixels: &mut self.pixels,
            size: self.size,
            stride: self.stride,
        })
    }

    pub fn lock_buffer_for_reading(&mut self, premultiply_alpha: bool) -> Option<PixelView> {
        if !self.map() {
            return None;
        }
        if !premultiply_alpha {
            return Some(PixelView { pixels: &self.pixels, size: self.size, stride: self.stride });
        }
        self.premultiplied.resize(self.pixels.len(), 0);
        copy_and_premultiply_alpha(&self.pixels, &mut self.premultiplied);
        Some(PixelView { pixels: &self.premultiplied, size: self.size, stride: self.stride })
    }

    pub fn unlock_buffer(&mut self) {
        debug_assert!(self.mapped, "unlocking an unmapped buffer");
        self.mapped = false;
    }

    fn lock_gl(&mut self, device: &mut dyn Device, is_write: bool) -> Option<TextureId> {
        debug_assert!(!self.mapped);
        let texture = device.create_texture();
        if !texture.is_valid() {
            return None;
        }
        device.upload_texture(self.texture_target(), texture,
                              self.size.width as u32, self.size.height as u32, &self.pixels);
        device.set_texture_filter(self.texture_target(), TextureFilter::Linear);
        self.uploaded = Some((texture, self.content_generation));
        self.is_locked_for_hardware_write = is_write;
        self.did_write_with_hardware |= is_write;
        Some(texture)
    }

    pub fn lock_buffer_for_reading_gl(&mut self, device: &mut dyn Device) -> Option<TextureId> {
        self.lock_gl(device, false)
    }

    pub fn lock_buffer_for_writing_gl(&mut self, device: &mut dyn Device) -> Option<TextureId> {
        self.lock_gl(device, true)
    }

    /// Re-uploads the mapping into `texture` if software writes happened
    /// since it was locked.
    pub fn sync_gl_texture(&mut self, device: &mut dyn Device, texture: TextureId) {
        match self.uploaded {
            Some((id, generation)) if id == texture && generation == self.content_generation => {}
            _ => {
                device.upload_texture(self.texture_target(), texture,
                                      self.size.width as u32, self.size.height as u32,
                                      &self.pixels);
                self.uploaded = Some((texture, self.content_generation));
            }
        }
    }

    pub fn unlock_buffer_gl(&mut self, device: &mut dyn Device, texture: TextureId) {
        debug_assert!(!self.mapped);
        device.delete_texture(texture);
        if self.uploaded.map_or(false, |(id, _)| id == texture) {
            self.uploaded = None;
        }
        if self.is_locked_for_hardware_write {
            self.is_locked_for_hardware_write = false;
            self.hardware_write_fence.set();
        }
    }

    /// Copies the pixels into `dest`, which must be the same size.
    pub fn copy_to(&mut self, dest: &mut MappedTexture) -> bool {
        if dest.size != self.size {
            return false;
        }
        let source = match self.lock_buffer_for_reading(false) {
            Some(view) => view.pixels.to_vec(),
            None => return false,
        };
        self.unlock_buffer();
        match dest.lock_buffer_for_writing() {
            Some(view) => view.pixels.copy_from_slice(&source),
            None => return false,
        }
        dest.unlock_buffer();
        true
    }

    /// The GL side went away with the context; textures from it are gone.
    pub fn did_reset_rendering_context(&mut self) {
        self.uploaded = None;
        self.is_locked_for_hardware_write = false;
        self.hardware_write_fence.clear();
        self.intact = false;
    }
}

impl Drop for MappedTexture {
    fn drop(&mut self) {
        debug_assert!(!self.mapped);
        self.limits.remove_memory_usage(self.pixels.len());
    }
}

impl BufferSource for MappedTexture {
    fn size(&self) -> Size2D<i32> {
        self.size
    }

    fn finish(&mut self) {
        self.read_fence.finish();
    }

    fn set_fence(&mut self) {
        self.read_fence.set();
    }

    fn is_intact(&self) -> bool {
        self.intact
    }

    fn lock_for_reading(&mut self, premultiply_alpha: bool) -> Option<PixelView> {
        self.lock_buffer_for_reading(premultiply_alpha)
    }

    fn lock_for_writing(&mut self) -> Option<PixelViewMut> {
        self.lock_buffer_for_writing()
    }

    fn unlock(&mut self) {
        self.unlock_buffer();
    }

    fn lock_for_gl_reading(&mut self, device: &mut dyn Device) -> Option<TextureId> {
        self.lock_buffer_for_reading_gl(device)
    }

    fn unlock_gl(&mut self, device: &mut dyn Device, texture: TextureId) {
        self.unlock_buffer_gl(device, texture);
    }

    fn delete_buffer_source(&mut self) {
        self.pixels = Vec::new();
        self.premultiplied = Vec::new();
        self.size = Size2D::zero();
        self.intact = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::RendererOptions;
    use crate::recording_device::RecordingDevice;

    fn limits(fds: usize) -> Arc<ResourceLimits> {
        Arc::new(ResourceLimits::with_file_descriptor_limit(&RendererOptions::default(), fds))
    }

    #[test]
    fn premultiply_keeps_extremes() {
        let source = [200, 100, 50, 255, 200, 100, 50, 0, 255, 255, 255, 127];
        let mut target = [0u8; 12];
        copy_and_premultiply_alpha(&source, &mut target);
        assert_eq!(target, [200, 100, 50, 255, 0, 0, 0, 0, 127, 127, 127, 127]);
    }

    #[test]
    fn creation_needs_a_file_descriptor() {
        let limits = limits(1);
        let size = Size2D::new(4, 4);
        let first = MappedTexture::new(&limits, ResourceContext::System, size,
                                       PixelFormat::HasAlpha, WriteMode::SOFTWARE);
        assert!(first.is_some());
        assert!(MappedTexture::new(&limits, ResourceContext::System, size,
                                   PixelFormat::HasAlpha, WriteMode::SOFTWARE).is_none());
        drop(first);
        assert!(MappedTexture::new(&limits, ResourceContext::System, size,
                                   PixelFormat::NoAlpha, WriteMode::SOFTWARE).is_some());
    }

    #[test]
    fn no_alpha_buffers_start_opaque() {
        let limits = limits(4);
        let mut texture = MappedTexture::new(&limits, ResourceContext::System, Size2D::new(2, 1),
                                             PixelFormat::NoAlpha, WriteMode::SOFTWARE).unwrap();
        {
            let view = texture.lock_buffer_for_reading(false).unwrap();
            assert_eq!(view.pixels, &[0, 0, 0, 255, 0, 0, 0, 255]);
        }
        texture.unlock_buffer();
    }

    #[test]
    fn gl_texture_follows_software_writes() {
        let limits = limits(4);
        let mut device = RecordingDevice::new();
        let mut texture = MappedTexture::new(&limits, ResourceContext::System, Size2D::new(2, 2),
                                             PixelFormat::HasAlpha, WriteMode::SOFTWARE).unwrap();
        let id = texture.lock_buffer_for_reading_gl(&mut device).unwrap();
        assert_eq!(device.textures[&id], (2, 2));

        texture.lock_buffer_for_writing().unwrap().pixels[0] = 9;
        texture.unlock_buffer();
        texture.sync_gl_texture(&mut device, id);

        let mut copy = MappedTexture::new(&limits, ResourceContext::System, Size2D::new(2, 2),
                                          PixelFormat::HasAlpha, WriteMode::SOFTWARE).unwrap();
        assert!(texture.copy_to(&mut copy));
        assert_eq!(copy.lock_buffer_for_reading(false).unwrap().pixels[0], 9);
        copy.unlock_buffer();

        texture.unlock_buffer_gl(&mut device, id);
        assert_eq!(device.deleted_textures, vec![id]);
    }
}
