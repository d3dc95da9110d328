/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The tiles backing one surface, across zoom changes.
//!
//! Three grids are kept. The front grid is drawn. While zooming in, the back
//! grid is painted at the new scale and swapped in once ready. While zooming
//! out, the low resolution grid is painted at a scale far enough below the
//! current one that it covers further zooming, and is swapped in when the
//! user settles.

use crate::device::Device;
use crate::draw_quad_data::Color;
use crate::options::RendererOptions;
use crate::shader_program::ShaderProgram;
use crate::tile_grid::{PrepareContext, PrepareRegion, TileGrid};
use crate::tiles_manager::TilesManager;
use crate::util::{IntRect, IntRegion, Matrix};
use euclid::{Point2D, Size2D};
use std::mem;
use std::sync::Arc;

/// Moves the span `start .. end` back inside `min .. max`, centering it when
/// it is larger.
fn fit_span_to_borders(start: i32, end: i32, min: i32, max: i32) -> i32 {
    if start < min && end > max {
        return (min + max) / 2 - (start + end) / 2;
    }
    if start < min {
        return min - start;
    }
    if end > max {
        return max - end;
    }
    0
}

/// Grows `area` around its center by `scale`, then shifts it to stay within
/// `full_content_area`.
pub fn scale_rect_in_rect(area: &IntRect, scale: f32, full_content_area: &IntRect) -> IntRect {
    let inflate_ratio = (scale - 1.0) / 2.0;
    let dx = (inflate_ratio * area.size.width as f32) as i32;
    let dy = (inflate_ratio * area.size.height as f32) as i32;
    let mut area = IntRect::new(Point2D::new(area.origin.x - dx, area.origin.y - dy),
                                Size2D::new(area.size.width + 2 * dx, area.size.height + 2 * dy));

    area.origin.x += fit_span_to_borders(area.min_x(), area.max_x(),
                                         full_content_area.min_x(), full_content_area.max_x());
    area.origin.y += fit_span_to_borders(area.min_y(), area.max_y(),
                                         full_content_area.min_y(), full_content_area.max_y());
    area
}

/// Texture needs of a frame at each layers rendering level.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TexturesResult {
    pub fixed: usize,
    pub scrollable: usize,
    pub clipped: usize,
    pub full: usize,
}

/// How the layer owning a surface moves with the page.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct LayerTraits {
    pub is_position_fixed: bool,
    pub content_is_scrollable: bool,
}

/// The page zoom as seen by a surface.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ViewScale {
    pub scale: f32,
    pub min_scale: f32,
}

pub struct SurfaceBacking {
    front_grid: TileGrid,
    back_grid: TileGrid,
    low_res_grid: TileGrid,
    /// Scale of the front grid, `None` until first prepared.
    scale: Option<f32>,
    future_scale: f32,
    max_zoom_scale: f32,
    last_scale: f32,
    last_zoom_out: f64,
    waiting_for_swap: bool,
    zoom_out_timeout: f64,
    low_res_scale_modifier: f32,
    extra_zoom_out_factor: f32,
}

impl SurfaceBacking {
    pub fn new(manager: &Arc<TilesManager>, options: &RendererOptions, is_base_surface: bool)
               -> SurfaceBacking {
        SurfaceBacking {
            front_grid: TileGrid::new(manager, is_base_surface),
            back_grid: TileGrid::new(manager, is_base_surface),
            low_res_grid: TileGrid::new(manager, is_base_surface),
            scale: None,
            future_scale: -1.0,
            max_zoom_scale: 1.0,
            last_scale: -1.0,
            last_zoom_out: 0.0,
            waiting_for_swap: false,
            zoom_out_timeout: options.zoom_out_timeout,
            low_res_scale_modifier: options.low_res_prefetch_scale_modifier,
            extra_zoom_out_factor: options.extra_zoom_out_factor,
        }
    }

    pub fn scale(&self) -> Option<f32> {
        self.scale
    }

    pub fn future_scale(&self) -> f32 {
        self.future_scale
    }

    pub fn front_grid(&self) -> &TileGrid {
        &self.front_grid
    }

    pub fn back_grid(&self) -> &TileGrid {
        &self.back_grid
    }

    pub fn low_res_grid(&self) -> &TileGrid {
        &self.low_res_grid
    }

    fn has_zoom_out_timed_out(&self, now: f64) -> bool {
        now - self.last_zoom_out >= self.zoom_out_timeout
    }

    pub fn is_zooming_in(&self) -> bool {
        self.scale.map_or(false, |scale| scale < self.future_scale)
    }

    pub fn is_zooming_out(&self) -> bool {
        self.scale.map_or(false, |scale| scale > self.future_scale)
    }

    pub fn is_zooming(&self) -> bool {
        self.is_zooming_in() || self.is_zooming_out()
    }

    /// Works out the scale to paint at this frame and updates the zoom
    /// target. Returns the requested scale.
    fn setup_scale(&mut self, view: &ViewScale, max_zoom_scale: f32, now: f64) -> f32 {
        // Once zoomed beyond 1.0 a surface may always do so again, so that
        // toggling zoom support does not force a repaint.
        self.max_zoom_scale = self.max_zoom_scale.max(max_zoom_scale);
        let scale = view.scale.min(self.max_zoom_scale);

        let current = match self.scale {
            Some(current) => current,
            None => {
                self.scale = Some(scale);
                self.future_scale = scale;
                self.last_scale = scale;
                scale
            }
        };

        // A recent decrease means the user is probably still zooming out.
        if scale < self.last_scale {
            self.last_zoom_out = now;
        }
        self.last_scale = scale;

        // The low resolution grid covers this scale: wait for it to be
        // painted before swapping it in.
        if self.is_zooming_out() && scale <= self.low_res_grid.scale() {
            self.waiting_for_swap = true;
        }

        // Zooming in while a zoom out is still in flight would thrash both
        // grids; wait for the zoomed out content to be shown first.
        let can_zoom_in = scale > current ||
            (self.has_zoom_out_timed_out(now) && !self.waiting_for_swap);

        if scale < self.future_scale && !self.waiting_for_swap {
            self.future_scale = (scale * self.extra_zoom_out_factor).max(view.min_scale);
            debug!("surface backing zooming out towards {}", self.future_scale);
        } else if scale > self.future_scale && can_zoom_in {
            self.future_scale = scale;
            self.waiting_for_swap = false;
            debug!("surface backing zooming in towards {}", self.future_scale);
        }

        scale
    }

    fn schedule_zooming(&mut self,
                        context: &mut PrepareContext,
                        scale: f32,
                        prepare_area: &IntRect,
                        full_content_area: &IntRect,
                        now: f64) {
        if !self.is_zooming() {
            return;
        }

        let predict_zoom = self.is_zooming_out() && !self.has_zoom_out_timed_out(now);
        let future_scale = self.future_scale;
        let (grid, future_area) = if predict_zoom {
            (&mut self.low_res_grid,
             scale_rect_in_rect(prepare_area, scale / future_scale, full_content_area))
        } else {
            (&mut self.back_grid, *prepare_area)
        };

        if future_scale != grid.scale() {
            grid.discard_textures();
        }
        grid.prepare_gl(context, future_scale, &future_area, full_content_area,
                        PrepareRegion::STANDARD, false, false);
        grid.swap_tiles();
    }

    /// Promotes a finished zoom grid to the front. Returns the regions the
    /// new front grid already has prepared.
    fn swap_grids_if_needed(&mut self, now: f64) -> PrepareRegion {
        if self.waiting_for_swap && self.low_res_grid.is_ready() {
            self.scale = Some(self.low_res_grid.scale());
            self.waiting_for_swap = false;

            // The high resolution front is not needed anymore.
            mem::swap(&mut self.front_grid, &mut self.low_res_grid);
            self.low_res_grid.discard_textures();
            debug!("surface backing settled on low resolution scale {:?}", self.scale);
            return PrepareRegion::empty();
        }

        let settled = self.is_zooming_in() ||
            (self.is_zooming_out() && self.has_zoom_out_timed_out(now));
        if settled && self.back_grid.is_ready() {
            self.scale = Some(self.future_scale);
            self.waiting_for_swap = false;

            mem::swap(&mut self.front_grid, &mut self.back_grid);
            self.front_grid.swap_tiles();

            // Neither of the other grids is up to date now.
            self.low_res_grid.discard_textures();
            self.back_grid.discard_textures();
            debug!("surface backing settled on scale {}", self.future_scale);
            return PrepareRegion::STANDARD;
        }

        PrepareRegion::empty()
    }

    pub fn prepare_gl(&mut self,
                      context: &mut PrepareContext,
                      view: &ViewScale,
                      max_zoom_scale: f32,
                      prepare_area: &IntRect,
                      full_content_area: &IntRect,
                      aggressive_rendering: bool,
                      update_with_blit: bool) {
        self.prepare_gl_at(context, view, max_zoom_scale, prepare_area, full_content_area,
                           aggressive_rendering, update_with_blit, time::precise_time_s())
    }

    fn prepare_gl_at(&mut self,
                     context: &mut PrepareContext,
                     view: &ViewScale,
                     max_zoom_scale: f32,
                     prepare_area: &IntRect,
                     full_content_area: &IntRect,
                     aggressive_rendering: bool,
                     update_with_blit: bool,
                     now: f64) {
        let scale = self.setup_scale(view, max_zoom_scale, now);
        self.schedule_zooming(context, scale, prepare_area, full_content_area, now);

        let mut regions = PrepareRegion::STANDARD;
        if aggressive_rendering {
            regions |= PrepareRegion::EXPANDED;
        }

        if self.is_zooming() {
            regions &= !self.swap_grids_if_needed(now);
        }

        if self.is_zooming() {
            return;
        }

        let current = self.scale.unwrap_or(scale);
        if !regions.is_empty() {
            self.front_grid.prepare_gl(context, current, prepare_area, full_content_area,
                                       regions, false, update_with_blit);
        }

        if aggressive_rendering {
            self.low_res_grid.prepare_gl(context, current * self.low_res_scale_modifier,
                                         prepare_area, full_content_area,
                                         PrepareRegion::STANDARD | PrepareRegion::EXPANDED,
                                         true, false);
            self.low_res_grid.swap_tiles();
        }
    }

    pub fn draw_gl(&self,
                   shader: &mut ShaderProgram,
                   device: &mut dyn Device,
                   visible_content_area: &IntRect,
                   opacity: f32,
                   transform: Option<&Matrix>,
                   aggressive_rendering: bool,
                   background: Option<&Color>) {
        // The low resolution content fills in while zooming out or while the
        // front grid has holes.
        if aggressive_rendering && opacity == 1.0 &&
           (self.is_zooming_out() || self.is_missing_content()) {
            self.low_res_grid.draw_gl(shader, device, visible_content_area, opacity, transform,
                                      None);
        }
        self.front_grid.draw_gl(shader, device, visible_content_area, opacity, transform,
                                background);
    }

    pub fn mark_as_dirty(&mut self, dirty_area: &IntRegion) {
        self.back_grid.mark_as_dirty(dirty_area);
        self.front_grid.mark_as_dirty(dirty_area);
        self.low_res_grid.mark_as_dirty(dirty_area);
    }

    pub fn swap_tiles(&self) -> bool {
        let mut swapped = self.back_grid.swap_tiles();
        swapped |= self.front_grid.swap_tiles();
        swapped |= self.low_res_grid.swap_tiles();
        swapped
    }

    /// Adds the textures this surface needs to `result`.
    pub fn compute_textures_amount(&self,
                                   result: &mut TexturesResult,
                                   visible_content_area: &IntRect,
                                   all_textures_area: &IntRect,
                                   layer: Option<&LayerTraits>) {
        self.compute_textures_amount_at(result, visible_content_area, all_textures_area, layer,
                                        time::precise_time_s())
    }

    fn compute_textures_amount_at(&self,
                                  result: &mut TexturesResult,
                                  visible_content_area: &IntRect,
                                  all_textures_area: &IntRect,
                                  layer: Option<&LayerTraits>,
                                  now: f64) {
        let grid = if self.is_zooming_out() && !self.has_zoom_out_timed_out(now) {
            &self.low_res_grid
        } else if self.is_zooming() {
            &self.back_grid
        } else {
            &self.front_grid
        };

        let full = grid.nb_textures(all_textures_area, self.future_scale);
        let clipped = grid.nb_textures(visible_content_area, self.future_scale);

        if let Some(layer) = layer {
            if layer.is_position_fixed {
                result.fixed += clipped;
            }
            if layer.content_is_scrollable || layer.is_position_fixed {
                result.scrollable += clipped;
            }
        }
        result.clipped += clipped;
        result.full += full;
    }

    pub fn discard_textures(&self) {
        self.front_grid.discard_textures();
        self.back_grid.discard_textures();
    }

    pub fn is_ready(&self) -> bool {
        !self.is_zooming() && self.front_grid.is_ready() && self.scale.map_or(false, |s| s > 0.0)
    }

    pub fn is_dirty(&self) -> bool {
        self.front_grid.is_dirty()
    }

    pub fn is_missing_content(&self) -> bool {
        self.is_zooming() || self.front_grid.is_missing_content()
    }

    pub fn nb_textures(&self, area: &IntRect, scale: f32) -> usize {
        self.front_grid.nb_textures(area, scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::painter::{RasterRenderer, TileCanvas, TilePainter};
    use crate::recording_device::RecordingDevice;
    use crate::resource_limits::ResourceLimits;
    use crate::texture_generator::TexturesGeneratorList;
    use crate::web_view_state::ScrollState;
    use std::sync::Mutex;

    struct StripePainter;

    impl TilePainter for StripePainter {
        fn paint(&self, canvas: &mut TileCanvas) -> bool {
            let rect = canvas.content_rect();
            canvas.fill_rect(&rect, Color::new(1.0, 1.0, 0.0, 1.0));
            let stripe = crate::util::FloatRect::new(rect.origin, Size2D::new(rect.size.width, 2.0));
            canvas.fill_rect(&stripe, Color::new(0.0, 0.0, 0.0, 1.0));
            true
        }
    }

    fn rect(x: i32, y: i32, w: i32, h: i32) -> IntRect {
        IntRect::new(Point2D::new(x, y), Size2D::new(w, h))
    }

    #[test]
    fn spans_are_kept_inside_the_content() {
        assert_eq!(fit_span_to_borders(-10, 50, 0, 100), 10);
        assert_eq!(fit_span_to_borders(60, 120, 0, 100), -20);
        assert_eq!(fit_span_to_borders(-10, 110, 0, 100), 0);
        assert_eq!(fit_span_to_borders(10, 20, 0, 100), 0);

        let full = rect(0, 0, 1000, 1000);
        assert_eq!(scale_rect_in_rect(&rect(100, 100, 100, 100), 3.0, &full),
                   rect(0, 0, 300, 300));
        assert_eq!(scale_rect_in_rect(&rect(400, 400, 100, 100), 2.0, &full),
                   rect(350, 350, 200, 200));
    }

    struct Fixture {
        options: RendererOptions,
        manager: Arc<TilesManager>,
        renderer: RasterRenderer,
        generators: TexturesGeneratorList,
        scroll_state: Arc<Mutex<ScrollState>>,
        painter: Arc<dyn TilePainter>,
        device: RecordingDevice,
    }

    fn fixture() -> Fixture {
        let mut options = RendererOptions::default();
        options.texture_generator_threads = 0;
        let limits = Arc::new(ResourceLimits::with_file_descriptor_limit(&options, 64));
        let manager = Arc::new(TilesManager::new(&options, &limits));
        manager.set_current_texture_count(16);
        manager.gather_textures();
        Fixture {
            renderer: RasterRenderer::new(&limits, options.tile_size),
            generators: TexturesGeneratorList::new(&options, &manager, &limits),
            options,
            manager,
            scroll_state: Arc::new(Mutex::new(ScrollState::default())),
            painter: Arc::new(StripePainter),
            device: RecordingDevice::new(),
        }
    }

    impl Fixture {
        fn prepare(&mut self, backing: &mut SurfaceBacking, scale: f32, now: f64) {
            let mut context = PrepareContext {
                device: &mut self.device,
                generators: &mut self.generators,
                scroll_state: &self.scroll_state,
                options: &self.options,
                painter: &self.painter,
            };
            let view = ViewScale { scale, min_scale: 0.25 };
            backing.prepare_gl_at(&mut context, &view, 4.0, &rect(0, 0, 256, 256),
                                  &rect(0, 0, 1024, 1024), false, false, now);
            self.manager.inc_draw_gl_count();
            self.manager.gather_textures();
        }

        fn paint(&mut self, grid: &TileGrid) {
            for tile in grid.tiles() {
                tile.paint_bitmap(&self.painter, &mut self.renderer, false);
            }
        }
    }

    fn settled_backing(f: &mut Fixture) -> SurfaceBacking {
        let mut backing = SurfaceBacking::new(&f.manager, &f.options, true);
        f.prepare(&mut backing, 1.0, 0.0);
        f.paint(backing.front_grid());
        backing.swap_tiles();
        assert!(backing.is_ready());
        backing
    }

    #[test]
    fn zooming_in_paints_the_back_grid_then_swaps() {
        let mut f = fixture();
        let mut backing = settled_backing(&mut f);

        f.prepare(&mut backing, 2.0, 10.0);
        assert!(backing.is_zooming_in());
        assert_eq!(backing.back_grid().scale(), 2.0);
        assert!(!backing.is_ready());
        assert!(backing.is_missing_content());

        f.paint(backing.back_grid());
        f.prepare(&mut backing, 2.0, 10.1);
        assert!(!backing.is_zooming());
        assert_eq!(backing.scale(), Some(2.0));
        assert_eq!(backing.front_grid().scale(), 2.0);
        assert!(backing.is_ready());
    }

    #[test]
    fn settled_zoom_is_left_alone() {
        let mut f = fixture();
        let mut backing = settled_backing(&mut f);
        f.prepare(&mut backing, 2.0, 10.0);
        f.paint(backing.back_grid());
        f.prepare(&mut backing, 2.0, 10.1);
        assert!(backing.is_ready());

        let tiles: Vec<_> = backing.front_grid().tiles().to_vec();
        let deleted = f.device.deleted_textures.len();
        for i in 0 .. 5 {
            f.prepare(&mut backing, 2.0, 11.0 + i as f64);
            assert!(!backing.is_zooming());
            assert!(backing.is_ready());
        }
        assert_eq!(backing.front_grid().tiles().len(), tiles.len());
        assert!(tiles.iter().all(|tile| tile.has_front() && !tile.is_dirty()));
        assert_eq!(f.device.deleted_textures.len(), deleted);
    }

    #[test]
    fn zooming_out_targets_a_lower_scale() {
        let mut f = fixture();
        let mut backing = settled_backing(&mut f);

        f.prepare(&mut backing, 0.8, 10.0);
        assert!(backing.is_zooming_out());
        assert_eq!(backing.future_scale(), 0.25);
        // Still zooming out: the low resolution grid is painted at the
        // target scale.
        assert_eq!(backing.low_res_grid().scale(), 0.25);

        f.paint(backing.low_res_grid());
        f.prepare(&mut backing, 0.2, 10.05);
        assert_eq!(backing.scale(), Some(0.25));
        assert!(!backing.is_zooming());
    }

    #[test]
    fn textures_are_counted_from_the_grid_being_prepared() {
        let mut f = fixture();
        let backing = settled_backing(&mut f);
        let mut result = TexturesResult::default();
        let traits = LayerTraits { is_position_fixed: true, content_is_scrollable: false };
        backing.compute_textures_amount_at(&mut result, &rect(0, 0, 256, 256),
                                           &rect(0, 0, 512, 512), Some(&traits), 100.0);
        assert_eq!(result, TexturesResult { fixed: 1, scrollable: 1, clipped: 1, full: 4 });
    }
}
