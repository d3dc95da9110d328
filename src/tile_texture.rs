/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! A pooled tile texture and its back-reference to the tile using it.
//!
//! A texture never owns its owner: it only keeps a weak handle, and handing
//! the texture to a new owner tells the previous one to forget about it.

use crate::device::{Device, TextureFilter, TextureId, TextureTarget};
use crate::draw_quad_data::{ContentFlags, DrawQuadData, DrawQuadType, TextureQuadData};
use crate::image_buffer::PixelView;
use crate::mapped_texture::MappedTexture;
use crate::shader_program::ShaderProgram;
use crate::util::{lock, FloatRect, IntRect, Matrix};
use euclid::{Point2D, Size2D};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

static NEXT_OWNER_ID: AtomicUsize = AtomicUsize::new(1);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct OwnerId(usize);

impl OwnerId {
    pub fn new() -> OwnerId {
        OwnerId(NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Something a `TileTexture` can be lent to.
pub trait TextureOwner: Send + Sync {
    fn owner_id(&self) -> OwnerId;
    /// The texture was handed to someone else; drop every reference to it.
    fn remove_texture(&self, texture: &TileTexture);
    /// Frame count at which the owner was last prepared.
    fn draw_count(&self) -> u64;
}

struct OwnerHandle {
    id: OwnerId,
    owner: Weak<dyn TextureOwner>,
}

struct TextureState {
    own_texture_id: Option<TextureId>,
    buffer: Option<MappedTexture>,
    needs_flip_y: bool,
    has_alpha: bool,
}

pub struct TileTexture {
    owner: Mutex<Option<OwnerHandle>>,
    state: Mutex<TextureState>,
}

impl TileTexture {
    pub fn new() -> TileTexture {
        TileTexture {
            owner: Mutex::new(None),
            state: Mutex::new(TextureState {
                own_texture_id: None,
                buffer: None,
                needs_flip_y: false,
                has_alpha: true,
            }),
        }
    }

    pub fn owner(&self) -> Option<Arc<dyn TextureOwner>> {
        lock(self.owner.lock()).as_ref().and_then(|handle| handle.owner.upgrade())
    }

    pub fn owner_id(&self) -> Option<OwnerId> {
        lock(self.owner.lock()).as_ref().map(|handle| handle.id)
    }

    /// Hands the texture to `new_owner`. The previous owner, if any, is
    /// told to let go of it.
    pub fn set_owner(&self, new_owner: Option<&Arc<dyn TextureOwner>>) {
        let previous = {
            let mut owner = lock(self.owner.lock());
            let new_id = new_owner.map(|o| o.owner_id());
            if owner.as_ref().map(|handle| handle.id) == new_id {
                return;
            }
            let handle = new_owner.map(|o| OwnerHandle {
                id: o.owner_id(),
                owner: Arc::downgrade(o),
            });
            std::mem::replace(&mut *owner, handle)
        };

        // The callback takes the owner's own lock, so it runs after ours
        // is dropped.
        if let Some(previous) = previous.and_then(|handle| handle.owner.upgrade()) {
            previous.remove_texture(self);
        }
    }

    /// Clears the owner if it is `owner`. Safe to call from any thread.
    pub fn release(&self, owner: OwnerId) -> bool {
        let mut current = lock(self.owner.lock());
        if current.as_ref().map(|handle| handle.id) != Some(owner) {
            return false;
        }
        *current = None;
        true
    }

    pub fn is_ready_for(&self, owner: OwnerId) -> bool {
        self.owner_id() == Some(owner)
    }

    pub fn has_texture(&self) -> bool {
        lock(self.state.lock()).own_texture_id.is_some()
    }

    pub fn has_buffer(&self) -> bool {
        lock(self.state.lock()).buffer.is_some()
    }

    pub fn has_alpha(&self) -> bool {
        lock(self.state.lock()).has_alpha
    }

    pub fn set_has_alpha(&self, has_alpha: bool) {
        lock(self.state.lock()).has_alpha = has_alpha;
    }

    /// Exchanges the pixel buffer with `buffer`. The renderer gets the old
    /// one back to paint the next tile into.
    pub fn swap_buffer(&self, buffer: &mut Option<MappedTexture>, needs_flip_y: bool) {
        let mut state = lock(self.state.lock());
        std::mem::swap(&mut state.buffer, buffer);
        state.needs_flip_y = needs_flip_y;
    }

    pub fn discard_gl_texture(&self, device: &mut dyn Device) {
        let mut state = lock(self.state.lock());
        let state = &mut *state;
        if let Some(texture) = state.own_texture_id.take() {
            match state.buffer {
                Some(ref mut buffer) => buffer.unlock_buffer_gl(device, texture),
                None => device.delete_texture(texture),
            }
        }
    }

    /// Gives up both the GL texture and the pixels.
    pub fn discard_backing_store(&self, device: &mut dyn Device) {
        self.discard_gl_texture(device);
        self.set_owner(None);
        lock(self.state.lock()).buffer = None;
    }

    /// Makes sure the GL texture exists and matches the pixel buffer.
    fn sync_texture(state: &mut TextureState, device: &mut dyn Device) -> Option<TextureId> {
        let buffer = state.buffer.as_mut()?;
        match state.own_texture_id {
            Some(texture) => {
                buffer.sync_gl_texture(device, texture);
                Some(texture)
            }
            None => {
                let texture = buffer.lock_buffer_for_reading_gl(device)?;
                state.own_texture_id = Some(texture);
                Some(texture)
            }
        }
    }

    pub fn prepare_for_blit(&self, device: &mut dyn Device) -> bool {
        let mut state = lock(self.state.lock());
        TileTexture::sync_texture(&mut state, device).is_some()
    }

    pub fn can_blit_update(&self) -> bool {
        self.has_texture()
    }

    /// Copies `subset` into the pixels covered by `inval` (in texture
    /// pixels) and pushes the change to GL.
    pub fn blit_update(&self, device: &mut dyn Device, subset: &PixelView, inval: &IntRect) {
        let mut state = lock(self.state.lock());
        {
            let buffer = match state.buffer {
                Some(ref mut buffer) => buffer,
                None => return,
            };
            let copied = match buffer.lock_buffer_for_writing() {
                Some(view) => {
                    let target = IntRect::new(Point2D::zero(), view.size);
                    let rows = inval.size.height.min(subset.size.height)
                        .min(target.size.height - inval.origin.y);
                    let columns = inval.size.width.min(subset.size.width)
                        .min(target.size.width - inval.origin.x);
                    if inval.origin.x >= 0 && inval.origin.y >= 0 && rows > 0 && columns > 0 {
                        let bytes = columns as usize * 4;
                        for row in 0 .. rows as usize {
                            let src = row * subset.stride;
                            let dst = (inval.origin.y as usize + row) * view.stride +
                                inval.origin.x as usize * 4;
                            view.pixels[dst .. dst + bytes]
                                .copy_from_slice(&subset.pixels[src .. src + bytes]);
                        }
                        true
                    } else {
                        false
                    }
                }
                None => false,
            };
            buffer.unlock_buffer();
            if !copied {
                return;
            }
        }
        TileTexture::sync_texture(&mut state, device);
    }

    /// Draws the texture. `rect` is the tile's geometry in content (or layer)
    /// coordinates.
    pub fn draw_gl(&self,
                   shader: &mut ShaderProgram,
                   device: &mut dyn Device,
                   is_layer: bool,
                   rect: &FloatRect,
                   opacity: f32,
                   transform: Option<&Matrix>,
                   force_blending: bool,
                   use_point_sampling: bool,
                   fill_portion: &FloatRect) {
        if is_layer && transform.is_none() {
            error!("a layer tile must be drawn with a transform");
            return;
        }

        let mut state = lock(self.state.lock());
        let texture = match TileTexture::sync_texture(&mut state, device) {
            Some(texture) => texture,
            None => return,
        };

        let mut geometry = *rect;
        if state.needs_flip_y {
            geometry = FloatRect::new(
                Point2D::new(rect.origin.x, rect.origin.y + rect.size.height),
                Size2D::new(rect.size.width, -rect.size.height),
            );
        }

        let mut flags = ContentFlags::CAN_DEFER_RENDERING;
        if !state.has_alpha || (!force_blending && !is_layer) {
            flags |= ContentFlags::HAS_NO_ALPHA;
        }
        let filter = if use_point_sampling {
            TextureFilter::Nearest
        } else {
            TextureFilter::Linear
        };
        let quad_type = if is_layer { DrawQuadType::Layer } else { DrawQuadType::Base };
        let data = TextureQuadData::new(
            DrawQuadData::new(quad_type, transform.cloned(), geometry, opacity)
                .with_fill_portion(*fill_portion),
            texture,
            TextureTarget::Default,
            filter,
            flags,
        );
        shader.draw_texture_quad(device, &data, None);
    }

    /// The context went away with our texture in it. The pixels go too since
    /// the driver may still reference them.
    pub fn did_reset_rendering_context(&self) {
        {
            let mut state = lock(self.state.lock());
            if state.own_texture_id.take().is_none() {
                return;
            }
            if let Some(mut buffer) = state.buffer.take() {
                buffer.did_reset_rendering_context();
            }
        }
        self.set_owner(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::RendererOptions;
    use crate::recording_device::RecordingDevice;
    use crate::mapped_texture::{PixelFormat, WriteMode};
    use crate::resource_limits::{ResourceContext, ResourceLimits};
    use std::sync::atomic::AtomicUsize;

    struct FakeOwner {
        id: OwnerId,
        removed: AtomicUsize,
    }

    impl FakeOwner {
        fn new() -> Arc<FakeOwner> {
            Arc::new(FakeOwner { id: OwnerId::new(), removed: AtomicUsize::new(0) })
        }
    }

    impl TextureOwner for FakeOwner {
        fn owner_id(&self) -> OwnerId {
            self.id
        }

        fn remove_texture(&self, _: &TileTexture) {
            self.removed.fetch_add(1, Ordering::SeqCst);
        }

        fn draw_count(&self) -> u64 {
            0
        }
    }

    fn buffer() -> MappedTexture {
        let limits = Arc::new(ResourceLimits::with_file_descriptor_limit(&RendererOptions::default(), 16));
        MappedTexture::new(&limits, ResourceContext::System, Size2D::new(4, 4),
                           PixelFormat::HasAlpha, WriteMode::SOFTWARE).unwrap()
    }

    #[test]
    fn new_owner_notifies_previous_owner_once() {
        let texture = TileTexture::new();
        let first = FakeOwner::new();
        let second = FakeOwner::new();
        let first_dyn: Arc<dyn TextureOwner> = first.clone();
        let second_dyn: Arc<dyn TextureOwner> = second.clone();

        texture.set_owner(Some(&first_dyn));
        texture.set_owner(Some(&first_dyn));
        assert_eq!(first.removed.load(Ordering::SeqCst), 0);

        texture.set_owner(Some(&second_dyn));
        assert_eq!(first.removed.load(Ordering::SeqCst), 1);
        assert!(texture.is_ready_for(second.id));

        texture.set_owner(None);
        texture.set_owner(None);
        assert_eq!(second.removed.load(Ordering::SeqCst), 1);
        assert!(texture.owner().is_none());
    }

    #[test]
    fn release_only_clears_the_matching_owner() {
        let texture = TileTexture::new();
        let owner = FakeOwner::new();
        let owner_dyn: Arc<dyn TextureOwner> = owner.clone();
        texture.set_owner(Some(&owner_dyn));
        assert!(!texture.release(OwnerId::new()));
        assert!(texture.release(owner.id));
        assert_eq!(texture.owner_id(), None);
        assert_eq!(owner.removed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dropped_owner_leaves_texture_unowned() {
        let texture = TileTexture::new();
        {
            let owner: Arc<dyn TextureOwner> = FakeOwner::new();
            texture.set_owner(Some(&owner));
        }
        assert!(texture.owner().is_none());
    }

    #[test]
    fn gl_texture_is_created_lazily_and_discarded() {
        let mut device = RecordingDevice::new();
        let texture = TileTexture::new();
        assert!(!texture.prepare_for_blit(&mut device));

        let mut incoming = Some(buffer());
        texture.swap_buffer(&mut incoming, false);
        assert!(incoming.is_none());
        assert!(!texture.can_blit_update());
        assert!(texture.prepare_for_blit(&mut device));
        assert!(texture.can_blit_update());
        assert_eq!(device.textures.len(), 1);

        texture.discard_gl_texture(&mut device);
        assert!(!texture.has_texture());
        assert_eq!(device.deleted_textures.len(), 1);
    }

    #[test]
    fn blit_writes_into_the_pixels() {
        let mut device = RecordingDevice::new();
        let texture = TileTexture::new();
        texture.swap_buffer(&mut Some(buffer()), false);
        texture.prepare_for_blit(&mut device);

        let pixels = [9u8; 2 * 2 * 4];
        let subset = PixelView { pixels: &pixels, size: Size2D::new(2, 2), stride: 8 };
        texture.blit_update(&mut device, &subset, &IntRect::new(Point2D::new(1, 1), Size2D::new(2, 2)));

        let mut out = None;
        texture.swap_buffer(&mut out, false);
        let mut out = out.unwrap();
        {
            let view = out.lock_buffer_for_reading(false).unwrap();
            assert_eq!(view.pixels[0], 0);
            assert_eq!(view.pixels[view.stride + 4], 9);
            assert_eq!(view.pixels[2 * view.stride + 8 + 3], 9);
            assert_eq!(view.pixels[3 * view.stride + 4], 0);
        }
        out.unlock_buffer();
    }

    #[test]
    fn context_reset_abandons_texture_and_owner() {
        let mut device = RecordingDevice::new();
        let texture = TileTexture::new();
        let owner = FakeOwner::new();
        let owner_dyn: Arc<dyn TextureOwner> = owner.clone();
        texture.set_owner(Some(&owner_dyn));

        // Without a GL texture there is nothing to abandon.
        texture.did_reset_rendering_context();
        assert!(texture.owner().is_some());

        texture.swap_buffer(&mut Some(buffer()), false);
        texture.prepare_for_blit(&mut device);
        texture.did_reset_rendering_context();
        assert!(!texture.has_texture());
        assert!(!texture.has_buffer());
        assert_eq!(owner.removed.load(Ordering::SeqCst), 1);
        assert!(device.deleted_textures.is_empty());
    }
}
