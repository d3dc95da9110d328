/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! A grid of tiles covering a surface at one scale.

use crate::device::Device;
use crate::draw_quad_data::{Color, DrawQuadData, DrawQuadType, PureColorQuadData};
use crate::options::RendererOptions;
use crate::paint_tile_operation::PaintTileOperation;
use crate::painter::TilePainter;
use crate::shader_program::ShaderProgram;
use crate::texture_generator::TexturesGeneratorList;
use crate::tile::Tile;
use crate::tiles_manager::TilesManager;
use crate::util::{intersect_rects, lock, rect_is_empty, FloatRect, IntRect, IntRegion, Matrix};
use crate::web_view_state::ScrollState;
use euclid::{Point2D, Rect, Size2D};
use std::sync::{Arc, Mutex};

/// Tiles around the prepared area painted ahead of time on fast GPUs.
const EXPANDED_BOUNDS_INFLATE: i32 = 1;
/// Extra rows painted ahead of time for low resolution content.
const EXPANDED_PREFETCH_BOUNDS_Y_INFLATE: i32 = 1;

bitflags! {
    pub struct PrepareRegion: u32 {
        /// The tiles covering the prepare area.
        const STANDARD = 1 << 0;
        /// Tiles around the prepare area, painted as prefetch.
        const EXPANDED = 1 << 1;
    }
}

/// What a grid needs to get its tiles painted.
pub struct PrepareContext<'a> {
    pub device: &'a mut dyn Device,
    pub generators: &'a mut TexturesGeneratorList,
    pub scroll_state: &'a Arc<Mutex<ScrollState>>,
    pub options: &'a RendererOptions,
    pub painter: &'a Arc<dyn TilePainter>,
}

/// Returns the tile coordinates covering `content_area` painted at `scale`.
pub fn compute_tiles_area(content_area: &IntRect, scale: f32, tile_size: i32) -> IntRect {
    let x = (content_area.origin.x as f32 * scale) as i32;
    let y = (content_area.origin.y as f32 * scale) as i32;
    let width = (content_area.size.width as f32 * scale).ceil() as i32;
    let height = (content_area.size.height as f32 * scale).ceil() as i32;
    if width == 0 || height == 0 {
        return IntRect::zero();
    }

    let tile_size_f = tile_size as f32;
    let left = (x as f32 / tile_size_f).floor() as i32;
    let top = (y as f32 / tile_size_f).floor() as i32;
    let right = ((x + width) as f32 / tile_size_f).ceil() as i32;
    let bottom = ((y + height) as f32 / tile_size_f).ceil() as i32;
    Rect::new(Point2D::new(left, top), Size2D::new(right - left, bottom - top))
}

fn rect_contains_point(rect: &IntRect, x: i32, y: i32) -> bool {
    x >= rect.min_x() && x < rect.max_x() && y >= rect.min_y() && y < rect.max_y()
}

pub struct TileGrid {
    manager: Arc<TilesManager>,
    is_base_surface: bool,
    tiles: Vec<Arc<Tile>>,
    /// Tile coordinates of the last prepared area.
    area: IntRect,
    scale: f32,
    dirty_region: IntRegion,
}

impl TileGrid {
    pub fn new(manager: &Arc<TilesManager>, is_base_surface: bool) -> TileGrid {
        TileGrid {
            manager: Arc::clone(manager),
            is_base_surface,
            tiles: Vec::new(),
            area: IntRect::zero(),
            scale: 1.0,
            dirty_region: IntRegion::new(),
        }
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn area(&self) -> IntRect {
        self.area
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    pub fn tiles(&self) -> &[Arc<Tile>] {
        &self.tiles
    }

    pub fn get_tile(&self, x: i32, y: i32) -> Option<&Arc<Tile>> {
        self.tiles.iter().find(|tile| tile.x() == x && tile.y() == y)
    }

    fn tile_size(&self) -> i32 {
        self.manager.tile_size()
    }

    /// Ready once every tile in the prepared area shows current content.
    /// A grid that can get no more layer textures counts as ready so zooming
    /// does not stall on it.
    pub fn is_ready(&self) -> bool {
        !self.manager.layer_textures_remain() || self.tiles
            .iter()
            .filter(|tile| tile.is_tile_visible(&self.area))
            .all(|tile| tile.is_tile_ready())
    }

    pub fn is_missing_content(&self) -> bool {
        self.tiles
            .iter()
            .any(|tile| tile.is_tile_visible(&self.area) && !tile.has_front())
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty_region.is_empty() ||
            self.tiles.iter().any(|tile| tile.is_tile_visible(&self.area) && tile.is_dirty())
    }

    /// Records `dirty_area`, in content coordinates. Tiles see it on the
    /// next prepare.
    pub fn mark_as_dirty(&mut self, dirty_area: &IntRegion) {
        self.dirty_region.union_region(dirty_area);
    }

    pub fn swap_tiles(&self) -> bool {
        let mut swapped = false;
        for tile in &self.tiles {
            swapped |= tile.swap_textures_if_needed();
        }
        swapped
    }

    pub fn discard_textures(&self) {
        for tile in &self.tiles {
            tile.discard_textures();
        }
    }

    /// Textures needed to show `area` at `scale`. Dirty tiles count twice
    /// while they keep their old front on screen.
    pub fn nb_textures(&self, area: &IntRect, scale: f32) -> usize {
        let bounds = compute_tiles_area(area, scale, self.tile_size());
        let mut count = (bounds.size.width * bounds.size.height).max(0) as usize;
        for tile in &self.tiles {
            if tile.is_tile_visible(&bounds) {
                count += tile.number_of_textures_needed().saturating_sub(1);
            }
        }
        count
    }

    pub fn prepare_gl(&mut self,
                      context: &mut PrepareContext,
                      scale: f32,
                      prepare_area: &IntRect,
                      full_content_area: &IntRect,
                      regions: PrepareRegion,
                      is_low_res_prefetch: bool,
                      update_with_blit: bool) {
        let tile_size = self.tile_size();
        self.area = compute_tiles_area(prepare_area, scale, tile_size);
        if rect_is_empty(&self.area) {
            return;
        }

        if self.scale != scale {
            debug!("tile grid {:p} moves from scale {} to {}", self, self.scale, scale);
            self.scale = scale;
        }

        if !self.dirty_region.is_empty() {
            for tile in &self.tiles {
                tile.mark_as_dirty(&self.dirty_region, context.painter);
            }
            self.dirty_region.clear();
        }

        if regions.contains(PrepareRegion::STANDARD) {
            let going_down = lock(context.scroll_state.lock()).is_going_down;
            let area = self.area;
            for i in 0 .. area.size.width {
                for j in 0 .. area.size.height {
                    let j = if going_down { j } else { area.size.height - 1 - j };
                    self.prepare_tile(context, area.origin.x + i, area.origin.y + j,
                                      is_low_res_prefetch, false, update_with_blit);
                }
            }
        }

        if regions.contains(PrepareRegion::EXPANDED) {
            let full_area = compute_tiles_area(full_content_area, scale, tile_size);
            let mut expanded = self.area;
            if self.manager.high_end_gfx() {
                expanded = expanded.inflate(EXPANDED_BOUNDS_INFLATE, EXPANDED_BOUNDS_INFLATE);
            }
            if is_low_res_prefetch {
                expanded = expanded.inflate(0, EXPANDED_PREFETCH_BOUNDS_Y_INFLATE);
            }

            if let Some(expanded) = intersect_rects(&expanded, &full_area) {
                let area = self.area;
                for x in expanded.min_x() .. expanded.max_x() {
                    for y in expanded.min_y() .. expanded.max_y() {
                        if !rect_contains_point(&area, x, y) {
                            self.prepare_tile(context, x, y, is_low_res_prefetch, true,
                                              update_with_blit);
                        }
                    }
                }
            }
        }
    }

    fn prepare_tile(&mut self,
                    context: &mut PrepareContext,
                    x: i32,
                    y: i32,
                    is_low_res_prefetch: bool,
                    is_expanded_prefetch: bool,
                    update_with_blit: bool) {
        let existing = self.get_tile(x, y).cloned();
        let tile = match existing {
            Some(tile) => tile,
            None => {
                let tile = Tile::new(&self.manager, x, y, !self.is_base_surface);
                self.tiles.push(Arc::clone(&tile));
                tile
            }
        };

        if tile.prepare_gl(context.device, self.scale, is_expanded_prefetch, update_with_blit,
                           context.painter) {
            let options = context.options;
            let operation = PaintTileOperation::new(&tile,
                                                    context.painter,
                                                    context.scroll_state,
                                                    &options.paint_priority,
                                                    options.tile_size,
                                                    is_low_res_prefetch,
                                                    options.show_visual_indicator);
            context.generators.schedule_operation(operation);
        }
    }

    /// Draws the tiles covering `visible_content_area`. Where a tile has
    /// nothing to show, `background` is drawn instead.
    pub fn draw_gl(&self,
                   shader: &mut ShaderProgram,
                   device: &mut dyn Device,
                   visible_content_area: &IntRect,
                   opacity: f32,
                   transform: Option<&Matrix>,
                   background: Option<&Color>) {
        if rect_is_empty(&self.area) {
            return;
        }

        let use_point_sampling = shader.use_point_sampling(self.scale, transform);
        let tile_width = self.tile_size() as f32 / self.scale;
        let tile_height = tile_width;
        let max_tile_x = visible_content_area.max_x() as f32 / tile_width;
        let max_tile_y = visible_content_area.max_y() as f32 / tile_height;
        let drawing_area = compute_tiles_area(visible_content_area, self.scale, self.tile_size());
        let force_blending = background.map_or(false, |color| color.has_alpha());

        let mut drawn = Vec::new();
        for tile in &self.tiles {
            if !tile.is_tile_visible(&drawing_area) {
                continue;
            }

            // Tiles straddling the right or bottom edge of the content only
            // draw the part inside it.
            let mut fill_portion = Rect::new(Point2D::zero(), Size2D::new(1.0, 1.0));
            if max_tile_x - (tile.x() as f32) < 1.0 {
                fill_portion.size.width = max_tile_x - tile.x() as f32;
            }
            if max_tile_y - (tile.y() as f32) < 1.0 {
                fill_portion.size.height = max_tile_y - tile.y() as f32;
            }
            let rect = FloatRect::new(
                Point2D::new(tile.x() as f32 * tile_width, tile.y() as f32 * tile_height),
                Size2D::new(tile_width * fill_portion.size.width,
                            tile_height * fill_portion.size.height),
            );

            if tile.draw_gl(shader, device, opacity, &rect, self.scale, transform,
                            force_blending, use_point_sampling, &fill_portion) {
                drawn.push((tile.x(), tile.y()));
            }
        }

        if let Some(background) = background {
            self.draw_missing_region(shader, device, visible_content_area, &drawing_area, &drawn,
                                     opacity, transform, background);
        }
    }

    fn draw_missing_region(&self,
                           shader: &mut ShaderProgram,
                           device: &mut dyn Device,
                           visible_content_area: &IntRect,
                           drawing_area: &IntRect,
                           drawn: &[(i32, i32)],
                           opacity: f32,
                           transform: Option<&Matrix>,
                           background: &Color) {
        let tile_size = self.tile_size() as f32 / self.scale;
        let visible = FloatRect::new(
            Point2D::new(visible_content_area.origin.x as f32, visible_content_area.origin.y as f32),
            Size2D::new(visible_content_area.size.width as f32,
                        visible_content_area.size.height as f32),
        );
        let quad_type = if self.is_base_surface { DrawQuadType::Base } else { DrawQuadType::Layer };

        for x in drawing_area.min_x() .. drawing_area.max_x() {
            for y in drawing_area.min_y() .. drawing_area.max_y() {
                if drawn.contains(&(x, y)) {
                    continue;
                }
                let cell = FloatRect::new(Point2D::new(x as f32 * tile_size, y as f32 * tile_size),
                                          Size2D::new(tile_size, tile_size));
                if let Some(missing) = intersect_rects(&cell, &visible) {
                    let data = PureColorQuadData::new(
                        DrawQuadData::new(quad_type, transform.cloned(), missing, opacity),
                        *background,
                    );
                    shader.draw_color_quad(device, &data);
                }
            }
        }
    }
}
