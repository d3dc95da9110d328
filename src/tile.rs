/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! One tile of a grid and the life cycle of its two textures.
//!
//! A tile displays its front backing while the back texture is painted on a
//! texture generator thread. Three generation counters decide what is
//! current: the picture generation moves on every invalidation, the front
//! and back generations record which picture they hold.

use crate::device::Device;
use crate::draw_quad_data::{Color, DrawQuadData, DrawQuadType, PureColorQuadData};
use crate::image_buffer::PixelView;
use crate::painter::{BaseRenderer, TilePainter, TileRenderInfo};
use crate::shader_program::ShaderProgram;
use crate::tile_texture::{OwnerId, TextureOwner, TileTexture};
use crate::tiles_manager::TilesManager;
use crate::util::{lock, FloatRect, IntRect, IntRegion, Matrix};
use euclid::{Point2D, Size2D};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// What a tile shows once painted.
#[derive(Clone)]
pub enum TileBacking {
    Texture(Arc<TileTexture>),
    /// The tile is a single color and needs no texture at all.
    PureColor(Color),
}

impl TileBacking {
    pub fn reserves_texture(&self) -> bool {
        match *self {
            TileBacking::Texture(_) => true,
            TileBacking::PureColor(_) => false,
        }
    }

    pub fn can_blit_update(&self) -> bool {
        match *self {
            TileBacking::Texture(ref texture) => texture.can_blit_update(),
            TileBacking::PureColor(_) => false,
        }
    }

    fn is_texture(&self, texture: &TileTexture) -> bool {
        match *self {
            TileBacking::Texture(ref own) => std::ptr::eq(&**own, texture),
            TileBacking::PureColor(_) => false,
        }
    }

    fn release(&self, owner: OwnerId) {
        if let TileBacking::Texture(ref texture) = *self {
            texture.release(owner);
        }
    }

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
        match *self {
            TileBacking::Texture(ref texture) => {
                texture.draw_gl(shader, device, is_layer, rect, opacity, transform,
                                force_blending, use_point_sampling, fill_portion);
            }
            TileBacking::PureColor(color) => {
                let quad_type = if is_layer { DrawQuadType::Layer } else { DrawQuadType::Base };
                let data = PureColorQuadData::new(
                    DrawQuadData::new(quad_type, transform.cloned(), *rect, opacity),
                    color,
                );
                shader.draw_color_quad(device, &data);
            }
        }
    }
}

/// Snapshot used to order paint operations.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct PriorityInfo {
    pub has_front_texture: bool,
    pub draw_count: u64,
    pub scale: f32,
}

struct TileState {
    front: Option<TileBacking>,
    back: Option<Arc<TileTexture>>,
    scale: f32,
    painter: Option<Arc<dyn TilePainter>>,
    picture_generation: u32,
    front_generation: u32,
    back_generation: u32,
    dirty_area: IntRegion,
    pure_color: Option<Color>,
}

impl TileState {
    fn mark_picture_changed(&mut self) {
        self.picture_generation = self.picture_generation.wrapping_add(1);
        if self.picture_generation == 0 {
            // Neither texture may look current after the wrap.
            self.front_generation = 0;
            self.back_generation = 0;
            self.picture_generation = 1;
        }
    }
}

/// Prefetch tiles rank as if drawn one frame earlier than the visible ones.
fn ranked_draw_count(draw_gl_count: u64, is_expanded_prefetch_tile: bool) -> u64 {
    if is_expanded_prefetch_tile {
        draw_gl_count.saturating_sub(1)
    } else {
        draw_gl_count
    }
}

pub(crate) fn same_painter(a: &Arc<dyn TilePainter>, b: &Arc<dyn TilePainter>) -> bool {
    &**a as *const dyn TilePainter as *const u8 == &**b as *const dyn TilePainter as *const u8
}

pub struct Tile {
    id: OwnerId,
    x: i32,
    y: i32,
    is_layer_tile: bool,
    manager: Arc<TilesManager>,
    draw_count: AtomicU64,
    state: Mutex<TileState>,
}

impl Tile {
    pub fn new(manager: &Arc<TilesManager>, x: i32, y: i32, is_layer_tile: bool) -> Arc<Tile> {
        Arc::new(Tile {
            id: OwnerId::new(),
            x,
            y,
            is_layer_tile,
            manager: Arc::clone(manager),
            draw_count: AtomicU64::new(0),
            state: Mutex::new(TileState {
                front: None,
                back: None,
                scale: 1.0,
                painter: None,
                picture_generation: 1,
                front_generation: 0,
                back_generation: 0,
                dirty_area: IntRegion::new(),
                pure_color: None,
            }),
        })
    }

    pub fn x(&self) -> i32 {
        self.x
    }

    pub fn y(&self) -> i32 {
        self.y
    }

    pub fn is_layer_tile(&self) -> bool {
        self.is_layer_tile
    }

    pub fn scale(&self) -> f32 {
        lock(self.state.lock()).scale
    }

    pub fn dirty_area(&self) -> IntRegion {
        lock(self.state.lock()).dirty_area.clone()
    }

    fn update_draw_count(&self, is_expanded_prefetch_tile: bool) {
        let draw_count = ranked_draw_count(self.manager.draw_gl_count(), is_expanded_prefetch_tile);
        self.draw_count.store(draw_count, Ordering::SeqCst);
    }

    pub fn copy_priority_info(&self) -> PriorityInfo {
        let state = lock(self.state.lock());
        PriorityInfo {
            has_front_texture: state.front.is_some(),
            draw_count: self.draw_count.load(Ordering::SeqCst),
            scale: state.scale,
        }
    }

    /// Gets the tile ready for drawing at `scale`. Returns true if a paint
    /// operation should be scheduled for it.
    pub fn prepare_gl(self: &Arc<Self>,
                      device: &mut dyn Device,
                      scale: f32,
                      is_expanded_prefetch_tile: bool,
                      should_try_update_with_blit: bool,
                      painter: &Arc<dyn TilePainter>)
                      -> bool {
        let scale_changes = {
            let state = lock(self.state.lock());
            let scale_changes = state.scale != scale;
            // Nothing to paint when the current picture is shown or only
            // waiting to be swapped in.
            if !scale_changes && (state.picture_generation == state.front_generation ||
                                  state.picture_generation == state.back_generation) {
                self.update_draw_count(is_expanded_prefetch_tile);
                return false;
            }
            scale_changes
        };

        if !scale_changes && should_try_update_with_blit && self.can_blit_update() &&
           painter.blit_from_contents(self, device) {
            self.update_draw_count(is_expanded_prefetch_tile);
            return false;
        }

        let mut state = lock(self.state.lock());
        self.update_draw_count(is_expanded_prefetch_tile);

        if scale_changes {
            self.discard_textures_internal(&mut state);
            state.mark_picture_changed();
            state.scale = scale;
        }

        // A paint may be needed for reasons other than an invalidation (a
        // new tile, a lost texture), so the painter is always refreshed.
        state.painter = Some(Arc::clone(painter));

        if state.back.is_some() {
            return true;
        }

        let owner: Arc<dyn TextureOwner> = self.clone();
        match self.manager.get_available_texture(&owner, self.is_layer_tile) {
            Some(texture) => {
                // The back texture gets new pixels and is swapped in later.
                texture.discard_gl_texture(device);
                state.back = Some(texture);
                true
            }
            None => false,
        }
    }

    pub fn number_of_textures_needed(&self) -> usize {
        let state = lock(self.state.lock());
        let front_reserves = state.front.as_ref().map_or(false, |front| front.reserves_texture());
        if state.picture_generation == state.front_generation {
            return front_reserves as usize;
        }
        if state.picture_generation == state.back_generation {
            return state.back.is_some() as usize;
        }
        // A dirty tile needs a back texture and may still be showing its front.
        if front_reserves { 2 } else { 1 }
    }

    /// Adds `dirty_area` (in content coordinates) to the area to repaint.
    pub fn mark_as_dirty(&self, dirty_area: &IntRegion, painter: &Arc<dyn TilePainter>) {
        if dirty_area.is_empty() {
            return;
        }
        let mut state = lock(self.state.lock());
        state.dirty_area.union_region(dirty_area);

        let tile_size = self.manager.tile_size() as f32;
        let tile_rect = FloatRect::new(Point2D::new(self.x as f32 * tile_size, self.y as f32 * tile_size),
                                       Size2D::new(tile_size, tile_size));
        let scale = state.scale;
        let intersects = dirty_area.rects().iter().any(|rect| {
            let scaled = FloatRect::new(
                Point2D::new(rect.origin.x as f32 * scale, rect.origin.y as f32 * scale),
                Size2D::new(rect.size.width as f32 * scale, rect.size.height as f32 * scale),
            );
            tile_rect.intersects(&scaled)
        });
        if !intersects {
            return;
        }

        state.mark_picture_changed();
        state.painter = Some(Arc::clone(painter));
    }

    pub fn is_dirty(&self) -> bool {
        let state = lock(self.state.lock());
        state.picture_generation != state.front_generation &&
            state.picture_generation != state.back_generation
    }

    /// True if the last painted content is current, either shown or waiting
    /// to be swapped in.
    pub fn is_tile_ready(&self) -> bool {
        let state = lock(self.state.lock());
        if state.back_generation == state.picture_generation &&
           (state.back.is_some() || state.pure_color.is_some()) {
            return true;
        }
        state.front_generation == state.picture_generation && state.front.is_some()
    }

    pub fn has_front(&self) -> bool {
        lock(self.state.lock()).front.is_some()
    }

    pub fn is_tile_visible(&self, view_tile_bounds: &IntRect) -> bool {
        self.x >= view_tile_bounds.origin.x &&
            self.x < view_tile_bounds.origin.x + view_tile_bounds.size.width &&
            self.y >= view_tile_bounds.origin.y &&
            self.y < view_tile_bounds.origin.y + view_tile_bounds.size.height
    }

    /// Draws the front backing. Returns false if nothing was drawn.
    pub fn draw_gl(&self,
                   shader: &mut ShaderProgram,
                   device: &mut dyn Device,
                   opacity: f32,
                   rect: &FloatRect,
                   scale: f32,
                   transform: Option<&Matrix>,
                   force_blending: bool,
                   use_point_sampling: bool,
                   fill_portion: &FloatRect)
                   -> bool {
        let front = {
            let state = lock(self.state.lock());
            if state.scale != scale {
                return false;
            }
            match state.front {
                Some(ref front) => front.clone(),
                None => return false,
            }
        };

        if fill_portion.max_x() < 1.0 || fill_portion.max_y() < 1.0 ||
           fill_portion.origin.x > 0.0 || fill_portion.origin.y > 0.0 {
            trace!("drawing tile {}, {} with fill portion {:?}", self.x, self.y, fill_portion);
        }
        front.draw_gl(shader, device, self.is_layer_tile, rect, opacity, transform,
                      force_blending, use_point_sampling, fill_portion);
        true
    }

    /// Paints the back texture. Runs on a texture generator thread.
    pub fn paint_bitmap(&self,
                        painter: &Arc<dyn TilePainter>,
                        renderer: &mut dyn BaseRenderer,
                        show_visual_indicator: bool) {
        let (scale, paint_generation) = {
            let state = lock(self.state.lock());
            let painter_matches = state.painter.as_ref().map_or(false, |p| same_painter(p, painter));
            if !painter_matches ||
               state.picture_generation == state.front_generation ||
               state.picture_generation == state.back_generation ||
               state.back.is_none() {
                return;
            }
            (state.scale, state.picture_generation)
        };

        let background = if self.is_layer_tile {
            Color::transparent()
        } else {
            painter.background().unwrap_or_else(|| Color::new(1.0, 1.0, 1.0, 1.0))
        };
        let info = TileRenderInfo {
            x: self.x,
            y: self.y,
            scale,
            background,
            painter: &**painter,
            show_visual_indicator,
        };
        let hints = renderer.render_tiled_content(&info);

        let mut state = lock(self.state.lock());
        // Content painted for a picture that has moved on is dropped; the
        // tile is still dirty and gets painted again.
        if !hints.did_render || state.picture_generation != paint_generation {
            return;
        }
        if hints.is_pure_color {
            state.pure_color = Some(hints.pure_color);
            state.back_generation = paint_generation;
        } else if let Some(back) = state.back.clone() {
            state.pure_color = None;
            renderer.commit_rendered_content_to_tile_texture(&back);
            back.set_has_alpha(hints.has_alpha);
            state.back_generation = paint_generation;
        }
    }

    pub fn discard_textures(&self) {
        let mut state = lock(self.state.lock());
        self.discard_textures_internal(&mut state);
    }

    fn discard_textures_internal(&self, state: &mut TileState) {
        if let Some(front) = state.front.take() {
            front.release(self.id);
            state.front_generation = 0;
        }
        if let Some(back) = state.back.take() {
            back.release(self.id);
            if state.pure_color.is_none() {
                state.back_generation = 0;
            }
        }
        state.dirty_area.clear();
    }

    /// Shows the back texture once it holds the current picture. Returns
    /// true if the front changed.
    pub fn swap_textures_if_needed(&self) -> bool {
        let mut state = lock(self.state.lock());
        if state.front_generation == state.picture_generation ||
           state.back_generation != state.picture_generation {
            return false;
        }

        if let Some(front) = state.front.take() {
            front.release(self.id);
        }
        let back = state.back.take();
        state.front = match state.pure_color {
            Some(color) => {
                if let Some(back) = back {
                    back.release(self.id);
                }
                Some(TileBacking::PureColor(color))
            }
            None => back.map(TileBacking::Texture),
        };
        state.front_generation = state.back_generation;
        if state.picture_generation == state.front_generation {
            state.dirty_area.clear();
        }
        state.back_generation = 0;

        debug_assert!(state.front.is_some());
        trace!("tile {}, {} now shows generation {}", self.x, self.y, state.front_generation);
        true
    }

    pub fn can_blit_update(&self) -> bool {
        lock(self.state.lock()).front.as_ref().map_or(false, |front| front.can_blit_update())
    }

    /// Lets the front texture take a blit.
    pub fn prepare_for_blit(&self, device: &mut dyn Device) -> bool {
        let front = lock(self.state.lock()).front.clone();
        match front {
            Some(TileBacking::Texture(texture)) => texture.prepare_for_blit(device),
            _ => false,
        }
    }

    /// Updates the front texture in place with `subset`, copied to `inval`
    /// in tile pixels, and marks the tile up to date.
    pub fn blit_update(&self, device: &mut dyn Device, subset: &PixelView, inval: &IntRect) {
        let front = {
            let mut state = lock(self.state.lock());
            // Marked clean before the blit so the generator is less likely
            // to pick the tile up meanwhile.
            state.dirty_area.clear();
            state.front_generation = state.picture_generation;
            if let Some(back) = state.back.take() {
                back.release(self.id);
                if state.pure_color.is_none() {
                    state.back_generation = 0;
                }
            }
            state.front.clone()
        };

        if let Some(TileBacking::Texture(texture)) = front {
            texture.blit_update(device, subset, inval);
        }
    }

    #[cfg(test)]
    fn generations(&self) -> (u32, u32, u32) {
        let state = lock(self.state.lock());
        (state.picture_generation, state.front_generation, state.back_generation)
    }

    #[cfg(test)]
    fn set_picture_generation(&self, generation: u32) {
        lock(self.state.lock()).picture_generation = generation;
    }
}

impl TextureOwner for Tile {
    fn owner_id(&self) -> OwnerId {
        self.id
    }

    fn remove_texture(&self, texture: &TileTexture) {
        let mut state = lock(self.state.lock());
        if state.front.as_ref().map_or(false, |front| front.is_texture(texture)) {
            // A blit cannot repair a missing front texture.
            state.dirty_area.clear();
            state.front = None;
            state.front_generation = 0;
        } else if state.back.as_ref().map_or(false, |back| std::ptr::eq(&**back, texture)) {
            state.back = None;
            if state.pure_color.is_none() {
                state.back_generation = 0;
            }
        }
    }

    fn draw_count(&self) -> u64 {
        self.draw_count.load(Ordering::SeqCst)
    }
}

impl Drop for Tile {
    fn drop(&mut self) {
        let state = lock(self.state.lock());
        if let Some(ref back) = state.back {
            back.release(self.id);
        }
        if let Some(ref front) = state.front {
            front.release(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::RendererOptions;
    use crate::painter::{RasterRenderer, TileCanvas};
    use crate::resource_limits::ResourceLimits;

    struct SolidPainter {
        color: Color,
        spot: Option<FloatRect>,
    }

    impl TilePainter for SolidPainter {
        fn paint(&self, canvas: &mut TileCanvas) -> bool {
            let rect = canvas.content_rect();
            canvas.fill_rect(&rect, self.color);
            if let Some(spot) = self.spot {
                canvas.fill_rect(&spot, Color::new(0.0, 0.0, 0.0, 1.0));
            }
            true
        }
    }

    struct Fixture {
        manager: Arc<TilesManager>,
        renderer: RasterRenderer,
        device: crate::recording_device::RecordingDevice,
    }

    fn fixture(textures: usize) -> Fixture {
        let options = RendererOptions::default();
        let limits = Arc::new(ResourceLimits::with_file_descriptor_limit(&options, 64));
        let manager = Arc::new(TilesManager::new(&options, &limits));
        manager.set_current_texture_count(textures);
        manager.gather_textures();
        Fixture {
            renderer: RasterRenderer::new(&limits, options.tile_size),
            manager,
            device: crate::recording_device::RecordingDevice::new(),
        }
    }

    fn painter(spot: bool) -> Arc<dyn TilePainter> {
        Arc::new(SolidPainter {
            color: Color::new(0.0, 1.0, 0.0, 1.0),
            spot: if spot {
                Some(FloatRect::new(Point2D::new(4.0, 4.0), Size2D::new(2.0, 2.0)))
            } else {
                None
            },
        })
    }

    fn region(x: i32, y: i32, w: i32, h: i32) -> IntRegion {
        IntRegion::from_rect(IntRect::new(Point2D::new(x, y), Size2D::new(w, h)))
    }

    #[test]
    fn a_new_tile_paints_and_swaps_in_its_back_texture() {
        let mut f = fixture(2);
        let tile = Tile::new(&f.manager, 0, 0, false);
        let painter = painter(true);
        assert!(tile.is_dirty());
        assert_eq!(tile.number_of_textures_needed(), 1);

        assert!(tile.prepare_gl(&mut f.device, 1.0, false, false, &painter));
        assert!(!tile.swap_textures_if_needed());
        tile.paint_bitmap(&painter, &mut f.renderer, false);
        assert_eq!(tile.generations(), (1, 0, 1));
        assert!(!tile.is_dirty());

        assert!(tile.swap_textures_if_needed());
        assert_eq!(tile.generations(), (1, 1, 0));
        assert!(tile.copy_priority_info().has_front_texture);
        assert_eq!(tile.number_of_textures_needed(), 1);

        // Nothing left to do for an up-to-date tile.
        assert!(!tile.prepare_gl(&mut f.device, 1.0, false, false, &painter));
    }

    #[test]
    fn pure_color_tiles_give_their_texture_back() {
        let mut f = fixture(1);
        let tile = Tile::new(&f.manager, 0, 0, false);
        let painter = painter(false);
        assert!(tile.prepare_gl(&mut f.device, 1.0, false, false, &painter));
        tile.paint_bitmap(&painter, &mut f.renderer, false);
        assert!(tile.swap_textures_if_needed());
        assert_eq!(tile.number_of_textures_needed(), 0);

        // The texture is free for another tile.
        f.manager.gather_textures();
        let other = Tile::new(&f.manager, 1, 0, false);
        assert!(other.prepare_gl(&mut f.device, 1.0, false, false, &painter));
    }

    #[test]
    fn invalidation_outside_the_tile_is_ignored() {
        let mut f = fixture(2);
        let tile = Tile::new(&f.manager, 1, 1, false);
        let painter = painter(true);
        tile.prepare_gl(&mut f.device, 1.0, false, false, &painter);
        tile.paint_bitmap(&painter, &mut f.renderer, false);
        tile.swap_textures_if_needed();
        assert!(!tile.is_dirty());

        tile.mark_as_dirty(&region(0, 0, 256, 256), &painter);
        assert!(!tile.is_dirty());
        assert!(!tile.dirty_area().is_empty());

        tile.mark_as_dirty(&region(300, 300, 10, 10), &painter);
        assert!(tile.is_dirty());
        assert_eq!(tile.generations().0, 2);
    }

    #[test]
    fn dirty_area_is_scaled_before_testing() {
        let mut f = fixture(2);
        let tile = Tile::new(&f.manager, 1, 0, false);
        let painter = painter(true);
        tile.prepare_gl(&mut f.device, 2.0, false, false, &painter);
        tile.paint_bitmap(&painter, &mut f.renderer, false);
        tile.swap_textures_if_needed();

        // Content x 130 lands on pixel 260 at scale 2, inside tile 1.
        tile.mark_as_dirty(&region(130, 0, 10, 10), &painter);
        assert!(tile.is_dirty());
    }

    #[test]
    fn picture_generation_only_moves_forward() {
        let f = fixture(1);
        let tile = Tile::new(&f.manager, 0, 0, false);
        let painter = painter(true);
        let mut last = tile.generations().0;
        for i in 0 .. 20 {
            tile.mark_as_dirty(&region(i, i, 1, 1), &painter);
            let picture = tile.generations().0;
            assert!(picture > last);
            last = picture;
        }
    }

    #[test]
    fn generation_wrap_invalidates_both_textures() {
        let mut f = fixture(2);
        let tile = Tile::new(&f.manager, 0, 0, false);
        let painter = painter(true);
        tile.prepare_gl(&mut f.device, 1.0, false, false, &painter);
        tile.set_picture_generation(u32::max_value());
        tile.paint_bitmap(&painter, &mut f.renderer, false);
        assert!(tile.swap_textures_if_needed());
        assert_eq!(tile.generations(), (u32::max_value(), u32::max_value(), 0));

        tile.mark_as_dirty(&region(0, 0, 1, 1), &painter);
        assert_eq!(tile.generations(), (1, 0, 0));
        assert!(tile.is_dirty());
    }

    #[test]
    fn stale_paints_are_not_committed() {
        struct InvalidatingRenderer<'a> {
            inner: RasterRenderer,
            tile: &'a Tile,
            painter: Arc<dyn TilePainter>,
        }

        impl<'a> BaseRenderer for InvalidatingRenderer<'a> {
            fn render_tiled_content(&mut self, info: &TileRenderInfo) -> crate::painter::TileContentHints {
                let hints = self.inner.render_tiled_content(info);
                self.tile.mark_as_dirty(&region(0, 0, 1, 1), &self.painter);
                hints
            }

            fn commit_rendered_content_to_tile_texture(&mut self, texture: &TileTexture) {
                self.inner.commit_rendered_content_to_tile_texture(texture);
            }
        }

        let mut f = fixture(1);
        let tile = Tile::new(&f.manager, 0, 0, false);
        let painter = painter(true);
        tile.prepare_gl(&mut f.device, 1.0, false, false, &painter);

        let mut renderer = InvalidatingRenderer {
            inner: RasterRenderer::new(f.manager.resource_limits(), 256),
            tile: &tile,
            painter: Arc::clone(&painter),
        };
        tile.paint_bitmap(&painter, &mut renderer, false);
        assert_eq!(tile.generations(), (2, 0, 0));
        assert!(tile.is_dirty());
        assert!(!tile.swap_textures_if_needed());
    }

    #[test]
    fn paint_requires_the_scheduling_painter() {
        let mut f = fixture(1);
        let tile = Tile::new(&f.manager, 0, 0, false);
        let scheduled = painter(true);
        tile.prepare_gl(&mut f.device, 1.0, false, false, &scheduled);
        tile.paint_bitmap(&painter(true), &mut f.renderer, false);
        assert_eq!(tile.generations().2, 0);
    }

    #[test]
    fn scale_change_discards_textures() {
        let mut f = fixture(2);
        let tile = Tile::new(&f.manager, 0, 0, false);
        let painter = painter(true);
        tile.prepare_gl(&mut f.device, 1.0, false, false, &painter);
        tile.paint_bitmap(&painter, &mut f.renderer, false);
        tile.swap_textures_if_needed();

        f.manager.inc_draw_gl_count();
        f.manager.gather_textures();
        assert!(tile.prepare_gl(&mut f.device, 2.0, false, false, &painter));
        assert_eq!(tile.scale(), 2.0);
        assert!(!tile.copy_priority_info().has_front_texture);
        assert_eq!(tile.generations(), (2, 0, 0));
    }

    #[test]
    fn losing_the_back_texture_keeps_the_tile_dirty() {
        let mut f = fixture(1);
        let tile = Tile::new(&f.manager, 0, 0, false);
        let painter = painter(true);
        tile.prepare_gl(&mut f.device, 1.0, false, false, &painter);

        // Two frames later another tile may take the texture.
        f.manager.inc_draw_gl_count();
        f.manager.inc_draw_gl_count();
        f.manager.gather_textures();
        let thief = Tile::new(&f.manager, 3, 3, false);
        assert!(thief.prepare_gl(&mut f.device, 1.0, false, false, &painter));

        tile.paint_bitmap(&painter, &mut f.renderer, false);
        assert_eq!(tile.generations().2, 0);
        assert!(tile.is_dirty());
    }

    #[test]
    fn prefetch_tiles_rank_one_frame_older() {
        let mut f = fixture(2);
        f.manager.inc_draw_gl_count();
        let painter = painter(true);
        let tile = Tile::new(&f.manager, 0, 0, false);
        tile.prepare_gl(&mut f.device, 1.0, true, false, &painter);
        assert_eq!(tile.copy_priority_info().draw_count, f.manager.draw_gl_count() - 1);

        assert_eq!(ranked_draw_count(0, true), 0);
        assert_eq!(ranked_draw_count(0, false), 0);
        assert_eq!(ranked_draw_count(7, true), 6);
    }

    #[test]
    fn draws_its_front_at_the_matching_scale() {
        use crate::shader_program::DrawInfo;
        use crate::util::to_float_rect;
        use euclid::Transform3D;

        let mut f = fixture(1);
        let tile = Tile::new(&f.manager, 0, 0, false);
        let painter = painter(true);
        let rect = FloatRect::new(Point2D::zero(), Size2D::new(256.0, 256.0));
        let unit = FloatRect::new(Point2D::zero(), Size2D::new(1.0, 1.0));
        let screen = IntRect::new(Point2D::zero(), Size2D::new(800, 600));
        let mut shader = ShaderProgram::new(f.manager.options(), &f.device.limits);
        assert!(shader.init_gl_resources(&mut f.device));
        shader.set_gl_draw_info(&DrawInfo {
            transform: Transform3D::identity(),
            is_layer: false,
            target_height: 600,
        });
        shader.set_up_drawing(&mut f.device, screen, to_float_rect(&screen), screen, 0, screen, 1.0);

        assert!(!tile.draw_gl(&mut shader, &mut f.device, 1.0, &rect, 1.0, None, false, false, &unit));
        tile.prepare_gl(&mut f.device, 1.0, false, false, &painter);
        tile.paint_bitmap(&painter, &mut f.renderer, false);
        tile.swap_textures_if_needed();
        assert!(!tile.draw_gl(&mut shader, &mut f.device, 1.0, &rect, 2.0, None, false, false, &unit));
        assert!(tile.draw_gl(&mut shader, &mut f.device, 1.0, &rect, 1.0, None, false, false, &unit));
        assert_eq!(shader.pending_quad_count(), 1);
        assert!(tile.can_blit_update());
    }
}
