/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Per-view compositor state: owns the surfaces of a web view, drives one
//! frame at a time and tells the caller what needs to be redrawn.

use crate::context_lost::{ContextLossTracker, ContextLostCallback};
use crate::device::{Device, ResetStatus};
use crate::draw_quad_data::Color;
use crate::options::RendererOptions;
use crate::paint_tile_operation::PaintTileOperation;
use crate::painter::TilePainter;
use crate::profiler::{FrameIndicator, FrameProfileCounters};
use crate::resource_limits::ResourceLimits;
use crate::shader_program::ShaderProgram;
use crate::surface_backing::{LayerTraits, SurfaceBacking, TexturesResult, ViewScale};
use crate::texture_generator::TexturesGeneratorList;
use crate::tile::same_painter;
use crate::tile_grid::PrepareContext;
use crate::tiles_manager::TilesManager;
use crate::util::{enclosing_int_rect, intersect_rects, lock, rect_is_empty, FloatRect};
use crate::util::{IntRect, IntRegion, Matrix};
use euclid::{Point2D, Size2D, Transform3D};
use std::sync::{Arc, Mutex};
use time::precise_time_ns;

/// Inflation applied to framework layer dirty areas.
const DIRTY_AREA_INFLATE: i32 = 8;

/// Scrolling state shared with the paint operations, which read it from the
/// generator threads to rank tiles.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ScrollState {
    /// Set by the embedder while a fling or drag is running.
    pub is_scrolling_set: bool,
    /// The last visible rect change moved the viewport by a partial page.
    pub is_visible_content_rect_scrolling: bool,
    pub is_going_down: bool,
    pub visible_content_rect: FloatRect,
}

impl ScrollState {
    pub fn is_scrolling(&self) -> bool {
        self.is_scrolling_set || self.is_visible_content_rect_scrolling
    }
}

impl Default for ScrollState {
    fn default() -> ScrollState {
        ScrollState {
            is_scrolling_set: false,
            is_visible_content_rect_scrolling: false,
            is_going_down: true,
            visible_content_rect: FloatRect::zero(),
        }
    }
}

/// How much of the layer content gets textures, from most to least.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum LayersRenderingMode {
    AllTextures,
    ClippedTextures,
    ScrollableAndFixedLayers,
    FixedLayers,
    SingleSurfaceRendering,
}

bitflags! {
    pub struct DrawStatus: u32 {
        /// The frame is incomplete: draw again.
        const DRAW = 0x1;
        /// The embedder must invalidate its view before the next draw.
        const INVOKE = 0x2;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Invalidation {
    Full,
    Rect(IntRect),
}

/// What the embedder hands over for each frame.
#[derive(Debug, Copy, Clone)]
pub struct FrameParams {
    /// Rect to invalidate in view coordinates if the frame needs a redraw.
    pub inv_screen_rect: IntRect,
    pub visible_content_rect: FloatRect,
    pub screen_rect: IntRect,
    pub title_bar_height: i32,
    pub screen_clip: IntRect,
    pub scale: f32,
    pub min_scale: f32,
    /// False when only preparing: nothing reaches the framebuffer.
    pub should_draw: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameResult {
    pub status: DrawStatus,
    pub invalidation: Option<Invalidation>,
    pub collections_swapped: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct LayerId(pub u32);

struct Surface {
    backing: SurfaceBacking,
    painter: Arc<dyn TilePainter>,
    /// Placement in content coordinates. The backing works in local
    /// coordinates starting at the origin.
    bounds: IntRect,
    traits: Option<LayerTraits>,
    opacity: f32,
}

impl Surface {
    fn local_area(&self) -> IntRect {
        IntRect::new(Point2D::zero(), self.bounds.size)
    }

    fn to_local(&self, area: &IntRect) -> IntRect {
        IntRect::new(Point2D::new(area.origin.x - self.bounds.origin.x,
                                  area.origin.y - self.bounds.origin.y),
                     area.size)
    }

    fn transform(&self) -> Option<Matrix> {
        if self.traits.is_none() {
            return None;
        }
        Some(Transform3D::create_translation(self.bounds.origin.x as f32,
                                             self.bounds.origin.y as f32,
                                             0.0))
    }

    fn mark_all_as_dirty(&mut self) {
        let area = self.local_area();
        self.backing.mark_as_dirty(&IntRegion::from_rect(area));
    }
}

/// Borrowed pieces of the state needed to prepare one surface.
struct FrameContext<'a> {
    device: &'a mut dyn Device,
    generators: &'a mut TexturesGeneratorList,
    scroll_state: &'a Arc<Mutex<ScrollState>>,
    options: &'a RendererOptions,
    view: ViewScale,
    visible_area: IntRect,
    aggressive_rendering: bool,
    all_textures: bool,
}

fn prepare_surface(surface: &mut Surface, frame: &mut FrameContext, needed: &mut TexturesResult) {
    let full = surface.local_area();
    let visible = surface.to_local(&frame.visible_area);
    let clipped = intersect_rects(&visible, &full).unwrap_or_else(IntRect::zero);
    surface.backing.compute_textures_amount(needed, &clipped, &full, surface.traits.as_ref());

    let prepare_area = if surface.traits.is_some() && frame.all_textures {
        full
    } else {
        clipped
    };
    if rect_is_empty(&prepare_area) {
        return;
    }

    let Surface { ref mut backing, ref painter, .. } = *surface;
    let mut context = PrepareContext {
        device: &mut *frame.device,
        generators: &mut *frame.generators,
        scroll_state: frame.scroll_state,
        options: frame.options,
        painter,
    };
    backing.prepare_gl(&mut context, &frame.view, frame.view.scale, &prepare_area, &full,
                       frame.aggressive_rendering, false);
}

pub struct WebViewState {
    options: RendererOptions,
    manager: Arc<TilesManager>,
    generators: TexturesGeneratorList,
    shader: ShaderProgram,
    scroll_state: Arc<Mutex<ScrollState>>,
    scale: f32,
    min_scale: f32,
    base: Option<Surface>,
    layers: Vec<(LayerId, Surface)>,
    next_layer_id: u32,
    layers_rendering_mode: LayersRenderingMode,
    force_single_surface_rendering: bool,
    show_visual_indicator: bool,
    /// Union of the inflated framework dirty areas for this frame, in view
    /// coordinates.
    framework_layers_inval: Option<IntRect>,
    do_framework_full_inval: bool,
    in_unclipped_draw: bool,
    last_draw_successful: bool,
    last_draw_ns: Option<u64>,
    frame_indicator: FrameIndicator,
    profile_counters: FrameProfileCounters,
    context_loss: ContextLossTracker,
}

impl WebViewState {
    pub fn new(options: &RendererOptions,
               limits: &Arc<ResourceLimits>,
               device: &dyn Device)
               -> WebViewState {
        let manager = Arc::new(TilesManager::new(options, limits));
        WebViewState {
            generators: TexturesGeneratorList::new(options, &manager, limits),
            shader: ShaderProgram::new(options, &device.limits()),
            options: options.clone(),
            manager,
            scroll_state: Arc::new(Mutex::new(ScrollState::default())),
            scale: 1.0,
            min_scale: 1.0,
            base: None,
            layers: Vec::new(),
            next_layer_id: 0,
            layers_rendering_mode: LayersRenderingMode::AllTextures,
            force_single_surface_rendering: false,
            show_visual_indicator: options.show_visual_indicator,
            framework_layers_inval: None,
            do_framework_full_inval: false,
            in_unclipped_draw: false,
            last_draw_successful: false,
            last_draw_ns: None,
            frame_indicator: FrameIndicator::new(),
            profile_counters: FrameProfileCounters::new(),
            context_loss: ContextLossTracker::new(),
        }
    }

    pub fn manager(&self) -> &Arc<TilesManager> {
        &self.manager
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn min_scale(&self) -> f32 {
        self.min_scale
    }

    pub fn profile_counters(&self) -> &FrameProfileCounters {
        &self.profile_counters
    }

    pub fn layers_rendering_mode(&self) -> LayersRenderingMode {
        self.layers_rendering_mode
    }

    pub fn is_single_surface_rendering_mode(&self) -> bool {
        self.force_single_surface_rendering ||
            self.layers_rendering_mode == LayersRenderingMode::SingleSurfaceRendering
    }

    pub fn set_force_single_surface_rendering(&mut self, force: bool) {
        self.force_single_surface_rendering = force;
    }

    pub fn show_visual_indicator(&self) -> bool {
        self.show_visual_indicator
    }

    pub fn was_last_draw_successful(&self) -> bool {
        self.last_draw_successful
    }

    pub fn in_unclipped_draw(&self) -> bool {
        self.in_unclipped_draw
    }

    pub fn set_context_lost_callback(&mut self, callback: ContextLostCallback) {
        self.context_loss.set_callback(callback);
    }

    /// Replaces the base surface content. The rendering mode starts over
    /// when the view gets its first real picture.
    pub fn set_base_layer(&mut self,
                          painter: Option<Arc<dyn TilePainter>>,
                          content_size: Size2D<i32>,
                          show_visual_indicator: bool,
                          is_picture_after_first_layout: bool) {
        if painter.is_none() || is_picture_after_first_layout {
            self.layers_rendering_mode = LayersRenderingMode::AllTextures;
        }
        self.show_visual_indicator = show_visual_indicator;

        let painter = match painter {
            Some(painter) => painter,
            None => {
                if let Some(base) = self.base.take() {
                    self.remove_operations_for_painter(&base.painter);
                }
                return;
            }
        };

        let bounds = IntRect::new(Point2D::zero(), content_size);
        match self.base {
            Some(ref mut base) => {
                if !same_painter(&base.painter, &painter) || base.bounds != bounds {
                    base.painter = painter;
                    base.bounds = bounds;
                    base.mark_all_as_dirty();
                }
            }
            None => {
                let mut base = Surface {
                    backing: SurfaceBacking::new(&self.manager, &self.options, true),
                    painter,
                    bounds,
                    traits: None,
                    opacity: 1.0,
                };
                base.mark_all_as_dirty();
                self.base = Some(base);
            }
        }
    }

    pub fn invalidate_base(&mut self, area: &IntRegion) {
        if let Some(ref mut base) = self.base {
            base.backing.mark_as_dirty(area);
        }
    }

    /// Adds a composited layer drawn over the base surface, in insertion
    /// order.
    pub fn add_layer(&mut self,
                     painter: Arc<dyn TilePainter>,
                     bounds: IntRect,
                     traits: LayerTraits,
                     opacity: f32)
                     -> LayerId {
        let id = LayerId(self.next_layer_id);
        self.next_layer_id += 1;
        let mut surface = Surface {
            backing: SurfaceBacking::new(&self.manager, &self.options, false),
            painter,
            bounds,
            traits: Some(traits),
            opacity,
        };
        surface.mark_all_as_dirty();
        self.layers.push((id, surface));
        id
    }

    pub fn remove_layer(&mut self, id: LayerId) -> bool {
        let index = match self.layers.iter().position(|&(layer, _)| layer == id) {
            Some(index) => index,
            None => return false,
        };
        let (_, surface) = self.layers.remove(index);
        self.remove_operations_for_painter(&surface.painter);
        true
    }

    /// Marks `area`, in layer coordinates, for repaint.
    pub fn invalidate_layer(&mut self, id: LayerId, area: &IntRegion) -> bool {
        match self.layers.iter_mut().find(|&&mut (layer, _)| layer == id) {
            Some(&mut (_, ref mut surface)) => {
                surface.backing.mark_as_dirty(area);
                true
            }
            None => false,
        }
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    fn remove_operations_for_painter(&mut self, painter: &Arc<dyn TilePainter>) {
        let painter = Arc::clone(painter);
        self.generators.remove_operations_for_filter(Arc::new(move |op: &PaintTileOperation| {
            same_painter(op.painter(), &painter)
        }));
    }

    pub fn scroll_state_handle(&self) -> &Arc<Mutex<ScrollState>> {
        &self.scroll_state
    }

    pub fn copy_scroll_state(&self) -> ScrollState {
        *lock(self.scroll_state.lock())
    }

    pub fn set_is_scrolling(&self, scrolling: bool) {
        lock(self.scroll_state.lock()).is_scrolling_set = scrolling;
    }

    pub fn is_scrolling(&self) -> bool {
        lock(self.scroll_state.lock()).is_scrolling()
    }

    fn set_visible_content_rect(&mut self, visible: &FloatRect, scale: f32, min_scale: f32) {
        // Enough textures for the visible tiles, twice over (four times on
        // capable GPUs) for prefetching and zooming.
        let inv_tile_size = scale / self.manager.tile_size() as f32;
        let max_tile_x = ((visible.size.width - 1.0) * inv_tile_size).ceil() as i32 + 1;
        let max_tile_y = ((visible.size.height - 1.0) * inv_tile_size).ceil() as i32 + 1;
        let factor = if self.manager.high_end_gfx() { 4 } else { 2 };
        self.manager.set_current_texture_count((max_tile_x * max_tile_y * factor).max(0) as usize);
        self.min_scale = min_scale;

        let mut scroll = lock(self.scroll_state.lock());
        if scroll.visible_content_rect == *visible && self.scale == scale {
            scroll.is_visible_content_rect_scrolling = false;
            return;
        }

        self.scale = scale;
        scroll.is_going_down = scroll.visible_content_rect.origin.y - visible.origin.y <= 0.0;
        scroll.is_visible_content_rect_scrolling = scroll.visible_content_rect != *visible &&
            scroll.visible_content_rect.intersects(visible);
        scroll.visible_content_rect = *visible;
        trace!("visible content rect {:?} at scale {}, going down: {}",
               visible, scale, scroll.is_going_down);
    }

    /// Records an area of the view, in view coordinates, that changed
    /// outside of the tiled surfaces.
    pub fn add_dirty_area(&mut self, area: &IntRect) {
        if rect_is_empty(area) {
            return;
        }
        let inflated = area.inflate(DIRTY_AREA_INFLATE, DIRTY_AREA_INFLATE);
        self.framework_layers_inval = Some(match self.framework_layers_inval {
            Some(inval) => inval.union(&inflated),
            None => inflated,
        });
    }

    pub fn reset_layers_dirty_area(&mut self) {
        self.framework_layers_inval = None;
        self.do_framework_full_inval = false;
    }

    pub fn do_framework_full_inval(&mut self) {
        self.do_framework_full_inval = true;
    }

    fn compute_invalidation(&self, inv_screen_rect: &IntRect) -> Invalidation {
        let inval = match self.framework_layers_inval {
            Some(inval) if !self.do_framework_full_inval => inval.inflate(1, 1),
            _ => return Invalidation::Full,
        };
        if !inval.intersects(inv_screen_rect) {
            return Invalidation::Full;
        }
        Invalidation::Rect(inval)
    }

    /// Picks the richest rendering mode that fits the layer texture budget.
    /// Returns true if the change requires a full invalidation.
    fn set_layers_rendering_mode(&mut self,
                                 device: &mut dyn Device,
                                 needed: &TexturesResult)
                                 -> bool {
        let mut invalidate = false;
        let mut max_textures = (2 * needed.full + 1).min(self.manager.max_texture_allocation());
        self.manager.set_current_layer_texture_count(device, max_textures);
        max_textures = self.manager.current_layer_texture_count();

        if self.layers_rendering_mode == LayersRenderingMode::SingleSurfaceRendering {
            // Leave some headroom before going back to rendering layers.
            max_textures /= 2;
        }

        let old_mode = self.layers_rendering_mode;
        self.layers_rendering_mode = LayersRenderingMode::SingleSurfaceRendering;
        if needed.fixed < max_textures {
            self.layers_rendering_mode = LayersRenderingMode::FixedLayers;
        }
        if needed.scrollable < max_textures {
            self.layers_rendering_mode = LayersRenderingMode::ScrollableAndFixedLayers;
        }
        if needed.clipped < max_textures {
            self.layers_rendering_mode = LayersRenderingMode::ClippedTextures;
        }
        if needed.full < max_textures {
            self.layers_rendering_mode = LayersRenderingMode::AllTextures;
        }

        // Partial layer rendering is not supported: fall back to a single
        // surface.
        if self.layers_rendering_mode > LayersRenderingMode::ClippedTextures {
            self.layers_rendering_mode = LayersRenderingMode::SingleSurfaceRendering;
        }

        if self.layers_rendering_mode < old_mode &&
           self.layers_rendering_mode != LayersRenderingMode::AllTextures {
            // Richer mode: the new textures need a complete repaint.
            invalidate = true;
        } else if self.layers_rendering_mode > old_mode &&
                  self.layers_rendering_mode != LayersRenderingMode::ClippedTextures {
            invalidate = true;
        }

        if self.layers_rendering_mode != old_mode {
            debug!("layers rendering mode {:?} -> {:?} ({:?}, max {})",
                   old_mode, self.layers_rendering_mode, needed, max_textures);
        }

        invalidate
    }

    fn mark_all_as_dirty(&mut self) {
        if let Some(ref mut base) = self.base {
            base.mark_all_as_dirty();
        }
        for &mut (_, ref mut layer) in &mut self.layers {
            layer.mark_all_as_dirty();
        }
    }

    fn check_rendering_context(&mut self, device: &mut dyn Device) {
        let status = device.reset_status();
        if status != ResetStatus::NoError {
            self.context_loss.mark_lost(status);
        }
        if self.context_loss.is_intact() {
            return;
        }

        let manager = &self.manager;
        let shader = &mut self.shader;
        self.context_loss.handle_context_loss_if_needed(|| {
            manager.did_reset_rendering_context();
            shader.did_reset_rendering_context();
        });
        // Everything is recreated lazily on the new context.
        self.context_loss.recover();
    }

    fn setup_drawing(&mut self, device: &mut dyn Device, frame: &FrameParams) {
        if self.shader.needs_init() && !self.shader.init_gl_resources(device) {
            warn!("failed to initialize the shader resources");
        }
        self.shader.set_up_drawing(device,
                                   frame.inv_screen_rect,
                                   frame.visible_content_rect,
                                   frame.screen_rect,
                                   frame.title_bar_height,
                                   frame.screen_clip,
                                   frame.scale);
        self.set_visible_content_rect(&frame.visible_content_rect, frame.scale, frame.min_scale);
    }

    /// Prepares and draws every surface. Returns the draw status and whether
    /// new content was swapped in.
    fn draw_surfaces(&mut self,
                     device: &mut dyn Device,
                     frame: &FrameParams,
                     needed: &mut TexturesResult)
                     -> (DrawStatus, bool) {
        let aggressive_rendering = !self.is_scrolling();
        let single_surface = self.is_single_surface_rendering_mode();
        let all_textures = self.layers_rendering_mode == LayersRenderingMode::AllTextures;
        let visible_area = enclosing_int_rect(&frame.visible_content_rect);

        let WebViewState {
            ref mut base,
            ref mut layers,
            ref mut generators,
            ref mut shader,
            ref mut profile_counters,
            ref scroll_state,
            ref options,
            ..
        } = *self;

        let mut surfaces: Vec<&mut Surface> = Vec::with_capacity(layers.len() + 1);
        if let Some(base) = base.as_mut() {
            surfaces.push(base);
        }
        if !single_surface {
            surfaces.extend(layers.iter_mut().map(|entry| &mut entry.1));
        }

        {
            let mut context = FrameContext {
                device: &mut *device,
                generators: &mut *generators,
                scroll_state,
                options,
                view: ViewScale { scale: frame.scale, min_scale: frame.min_scale },
                visible_area,
                aggressive_rendering,
                all_textures,
            };
            for surface in &mut surfaces {
                prepare_surface(surface, &mut context, needed);
            }
        }
        profile_counters.surfaces_prepared.add(surfaces.len());
        profile_counters.paints_scheduled.set(generators.pending_operation_count());
        generators.commit_paint_tile_batch_if_needed();

        let mut status = DrawStatus::empty();
        let mut swapped = false;
        let mut dirty_layers = Vec::new();
        for surface in &surfaces {
            if surface.backing.swap_tiles() {
                swapped = true;
                if surface.traits.is_some() {
                    dirty_layers.push(surface.bounds);
                }
            }
            if !surface.backing.is_ready() {
                status |= DrawStatus::DRAW;
            }
        }
        if swapped {
            status |= DrawStatus::DRAW;
        }

        if frame.should_draw {
            for surface in &surfaces {
                let visible = surface.to_local(&visible_area);
                let clipped = match intersect_rects(&visible, &surface.local_area()) {
                    Some(clipped) => clipped,
                    None => continue,
                };
                let background = if surface.traits.is_none() {
                    Some(surface.painter.background().unwrap_or_else(|| Color::new(1.0, 1.0, 1.0, 1.0)))
                } else {
                    None
                };
                let transform = surface.transform();
                surface.backing.draw_gl(shader,
                                        &mut *device,
                                        &clipped,
                                        surface.opacity,
                                        transform.as_ref(),
                                        aggressive_rendering,
                                        background.as_ref());
                profile_counters.surfaces_drawn.inc();
            }
        }

        drop(surfaces);
        for bounds in dirty_layers {
            let view_rect = self.content_to_view_rect(&bounds, &frame.visible_content_rect);
            self.add_dirty_area(&view_rect);
        }

        (status, swapped)
    }

    fn content_to_view_rect(&self, rect: &IntRect, visible: &FloatRect) -> IntRect {
        let x = (rect.origin.x as f32 - visible.origin.x) * self.scale;
        let y = (rect.origin.y as f32 - visible.origin.y) * self.scale;
        enclosing_int_rect(&FloatRect::new(Point2D::new(x, y),
                                           Size2D::new(rect.size.width as f32 * self.scale,
                                                       rect.size.height as f32 * self.scale)))
    }

    fn show_frame_info(&mut self,
                       device: &mut dyn Device,
                       now_ns: u64,
                       rect: &IntRect,
                       collections_swapped: bool) {
        if !self.show_visual_indicator {
            return;
        }
        for bar in self.frame_indicator.next_frame(now_ns, collections_swapped, rect) {
            self.shader.clear_rect_with_color(device, &bar.rect, bar.color);
        }
        self.shader.flush_drawing(device);
    }

    /// Composites one frame.
    pub fn draw_gl(&mut self, device: &mut dyn Device, frame: &FrameParams) -> FrameResult {
        self.manager.inc_draw_gl_count();
        self.profile_counters.reset();
        self.profile_counters.frame_counter.inc();
        self.in_unclipped_draw = frame.should_draw && frame.screen_rect == frame.screen_clip;
        self.reset_layers_dirty_area();

        self.check_rendering_context(device);
        self.setup_drawing(device, frame);
        self.manager.gather_textures();
        self.profile_counters.available_textures.set(self.manager.available_texture_count());

        let mut needed = TexturesResult::default();
        let (mut status, collections_swapped) = self.draw_surfaces(device, frame, &mut needed);
        if frame.should_draw {
            let shader = &mut self.shader;
            self.profile_counters.draw_time.profile(|| shader.flush_drawing(device));
        }

        if self.set_layers_rendering_mode(device, &needed) {
            self.mark_all_as_dirty();
            self.do_framework_full_inval();
            status |= DrawStatus::DRAW | DrawStatus::INVOKE;
        }

        let invalidation = if status.contains(DrawStatus::DRAW) {
            Some(self.compute_invalidation(&frame.inv_screen_rect))
        } else {
            None
        };
        self.last_draw_successful = status.is_empty();

        let now_ns = precise_time_ns();
        if frame.should_draw {
            self.show_frame_info(device, now_ns, &frame.inv_screen_rect, collections_swapped);
        }
        if let Some(last) = self.last_draw_ns {
            self.profile_counters.frame_time.set(now_ns.saturating_sub(last));
        }
        self.last_draw_ns = Some(now_ns);
        if self.show_visual_indicator {
            self.profile_counters.log();
        }

        if status.contains(DrawStatus::INVOKE) {
            status = DrawStatus::DRAW;
        }

        FrameResult {
            status,
            invalidation,
            collections_swapped,
        }
    }

    /// True shortly after a frame was drawn. Other GPU clients should yield
    /// to the compositor during that window.
    pub fn has_render_priority(&self) -> bool {
        self.has_render_priority_at(precise_time_ns())
    }

    fn has_render_priority_at(&self, now_ns: u64) -> bool {
        match self.last_draw_ns {
            Some(last) => {
                let elapsed = now_ns.saturating_sub(last) as f64 / 1000000000.0;
                elapsed < self.options.render_priority_cutoff
            }
            None => false,
        }
    }
}

impl Drop for WebViewState {
    fn drop(&mut self) {
        self.generators.remove_operations_for_filter(Arc::new(|_: &PaintTileOperation| true));
        self.generators.flush_pending_paint_tile_batches();
    }
}
