/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use crate::options::PaintPriorityWeights;
use crate::painter::{BaseRenderer, TilePainter};
use crate::tile::Tile;
use crate::util::{lock, FloatPoint, Matrix, MatrixHelpers};
use crate::web_view_state::ScrollState;
use euclid::{Point2D, Transform3D};
use std::sync::{Arc, Mutex};

/// How far ahead of the viewport center, in viewport heights, painting is
/// focused while scrolling.
const SCROLLING_OFFSET_FACTOR: f32 = 0.5;

/// Decides which queued operations to drop when a batch is added.
pub type OperationFilter = Arc<dyn Fn(&PaintTileOperation) -> bool + Send + Sync>;

fn focus_point(scroll_state: &ScrollState) -> FloatPoint {
    let viewport = scroll_state.visible_content_rect;
    let mut focus = Point2D::new(viewport.origin.x + viewport.size.width / 2.0,
                                 viewport.origin.y + viewport.size.height / 2.0);
    if scroll_state.is_scrolling_set {
        let direction = if scroll_state.is_going_down { 1.0 } else { -1.0 };
        focus.y += direction * viewport.size.height * SCROLLING_OFFSET_FACTOR;
    }
    focus
}

/// A request to paint one tile, queued on a texture generator thread.
pub struct PaintTileOperation {
    tile: Arc<Tile>,
    painter: Arc<dyn TilePainter>,
    scroll_state: Arc<Mutex<ScrollState>>,
    weights: PaintPriorityWeights,
    tile_size: i32,
    is_low_res_prefetch: bool,
    show_visual_indicator: bool,
    use_position_for_priority: bool,
    draw_transform: Matrix,
}

impl PaintTileOperation {
    pub fn new(tile: &Arc<Tile>,
               painter: &Arc<dyn TilePainter>,
               scroll_state: &Arc<Mutex<ScrollState>>,
               weights: &PaintPriorityWeights,
               tile_size: i32,
               is_low_res_prefetch: bool,
               show_visual_indicator: bool)
               -> PaintTileOperation {
        let draw_transform = painter.draw_transform();
        PaintTileOperation {
            tile: Arc::clone(tile),
            painter: Arc::clone(painter),
            scroll_state: Arc::clone(scroll_state),
            weights: weights.clone(),
            tile_size,
            is_low_res_prefetch,
            show_visual_indicator,
            // Layer tiles are only ranked by position when their content
            // coordinates are known.
            use_position_for_priority: !tile.is_layer_tile() || draw_transform.is_some(),
            draw_transform: draw_transform.unwrap_or_else(Transform3D::identity),
        }
    }

    pub fn tile(&self) -> &Arc<Tile> {
        &self.tile
    }

    pub fn painter(&self) -> &Arc<dyn TilePainter> {
        &self.painter
    }

    pub fn is_low_res_prefetch(&self) -> bool {
        self.is_low_res_prefetch
    }

    pub fn run(&self, renderer: &mut dyn BaseRenderer) {
        self.tile.paint_bitmap(&self.painter, renderer, self.show_visual_indicator);
    }

    /// Lower values are painted first. Computed fresh on every call since
    /// scrolling and drawing move it around.
    pub fn priority(&self, current_draw: u64) -> i64 {
        let weights = &self.weights;
        let scroll_state = *lock(self.scroll_state.lock());

        let mut priority = weights.base;
        // Low resolution tiles only matter while scrolling; otherwise they
        // wait for an idle moment.
        if self.is_low_res_prefetch {
            priority = if scroll_state.is_scrolling() { 0 } else { weights.defer_cutoff };
        }

        let info = self.tile.copy_priority_info();

        let draw_delta = (current_draw as i64 - info.draw_count as i64)
            .max(0)
            .min(weights.max_frames_since_drawn);
        priority += weights.per_frame_since_drawn * draw_delta;

        // Within one frame, tiles showing nothing yet go first.
        if info.has_front_texture {
            priority += weights.has_front_texture;
        }

        if self.use_position_for_priority {
            let tile_size = self.tile_size as f32;
            let position = Point2D::new((self.tile.x() as f32 + 0.5) * tile_size / info.scale,
                                        (self.tile.y() as f32 + 0.5) * tile_size / info.scale);
            let position = self.draw_transform.map_point(&position);
            let distance = focus_point(&scroll_state) - position;
            priority += distance.x.hypot(distance.y) as i64;
        }

        priority
    }
}
