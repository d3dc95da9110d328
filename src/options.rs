/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

pub const TILE_SIZE: i32 = 256;

/// Weights for the paint queue ordering. Lower values paint first.
#[derive(Clone, Debug)]
pub struct PaintPriorityWeights {
    pub base: i64,
    pub per_frame_since_drawn: i64,
    pub max_frames_since_drawn: i64,
    pub has_front_texture: i64,
    /// Operations at or above this priority wait for the next idle period.
    pub defer_cutoff: i64,
}

impl Default for PaintPriorityWeights {
    fn default() -> PaintPriorityWeights {
        PaintPriorityWeights {
            base: 200000,
            per_frame_since_drawn: 100000,
            max_frames_since_drawn: 1000,
            has_front_texture: 50000,
            defer_cutoff: 500000000,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RendererOptions {
    pub tile_size: i32,
    /// Tiles painted beyond the visible rect on every side.
    pub prefetch_distance: i32,
    pub high_end_gfx: bool,
    pub texture_generator_threads: usize,
    pub paint_priority: PaintPriorityWeights,
    pub layer_textures_destroy_timeout: f64,
    pub zoom_out_timeout: f64,
    pub low_res_prefetch_scale_modifier: f32,
    pub extra_zoom_out_factor: f32,
    /// Combined pixel area of image surfaces above which quad buffering is
    /// turned off.
    pub max_combined_surface_area: u64,
    pub graphics_memory_limit: usize,
    /// Byte budget for plain memory allocations. `None` means unbounded.
    pub memory_budget: Option<usize>,
    pub render_priority_cutoff: f64,
    pub show_visual_indicator: bool,
    pub inverted_screen: bool,
    pub inverted_screen_contrast: f32,
}

impl RendererOptions {
    pub fn max_texture_allocation(&self) -> usize {
        self.texture_allocation_for(self.high_end_gfx)
    }

    /// Enough textures for two pages of tiles around the viewport, halved
    /// on low-end GPUs.
    pub fn texture_allocation_for(&self, high_end_gfx: bool) -> usize {
        let p = self.prefetch_distance.max(0) as usize;
        let count = (10 + 2 * p) * (7 + 2 * p) * 4;
        if high_end_gfx {
            count
        } else {
            count / 2
        }
    }
}

impl Default for RendererOptions {
    fn default() -> RendererOptions {
        RendererOptions {
            tile_size: TILE_SIZE,
            prefetch_distance: 1,
            high_end_gfx: true,
            texture_generator_threads: 2,
            paint_priority: PaintPriorityWeights::default(),
            layer_textures_destroy_timeout: 60.0,
            zoom_out_timeout: 0.1,
            low_res_prefetch_scale_modifier: 0.3,
            extra_zoom_out_factor: 0.2,
            max_combined_surface_area: 256 * 1024 * 1024 / 4 / 4,
            graphics_memory_limit: 400 * 1024 * 1024,
            memory_budget: None,
            render_priority_cutoff: 0.1,
            show_visual_indicator: false,
            inverted_screen: false,
            inverted_screen_contrast: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RendererOptions;

    #[test]
    fn texture_allocation_depends_on_gpu_tier() {
        let mut options = RendererOptions::default();
        assert_eq!(options.max_texture_allocation(), 432);
        options.high_end_gfx = false;
        assert_eq!(options.max_texture_allocation(), 216);
    }
}
