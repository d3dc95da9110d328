/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use crate::device::Device;
use crate::draw_quad_data::Color;
use crate::image_buffer::PixelViewMut;
use crate::mapped_texture::{MappedTexture, PixelFormat, WriteMode};
use crate::options::TILE_SIZE;
use crate::resource_limits::{ResourceContext, ResourceLimits};
use crate::tile::Tile;
use crate::tile_texture::TileTexture;
use crate::util::{FloatPoint, FloatRect, Matrix};
use euclid::{Point2D, Size2D};
use std::sync::Arc;
use time::precise_time_ns;

const CLUSTER_HEIGHT: usize = 8;
const CLUSTER_INCREMENT: usize = 11;
/// Pixels compared before checking for an early exit.
const RUN_PIXELS: usize = 64;

lazy_static! {
    static ref TILE_CLUSTER_ORDER: Vec<usize> = cluster_order(TILE_SIZE as usize / CLUSTER_HEIGHT);
}

/// Produces the content of tiles. Called from the texture generator
/// threads, so it must not touch compositor state.
pub trait TilePainter: Send + Sync {
    /// Paints into `canvas`. Returns false if nothing could be painted.
    fn paint(&self, canvas: &mut TileCanvas) -> bool;

    /// The color painted under the content. `None` means opaque white.
    fn background(&self) -> Option<Color> {
        None
    }

    /// Maps layer coordinates to content coordinates for painters that
    /// belong to a layer. Used to rank their tiles by position.
    fn draw_transform(&self) -> Option<Matrix> {
        None
    }

    /// Tries to update `tile`'s front texture in place on the compositor
    /// thread instead of scheduling a repaint.
    fn blit_from_contents(&self, _tile: &Tile, _device: &mut dyn Device) -> bool {
        false
    }
}

/// Tile-sized drawing target. Coordinates handed to the fill methods are in
/// content space; the canvas applies the tile scale and position.
pub struct TileCanvas<'a> {
    view: PixelViewMut<'a>,
    origin: FloatPoint,
    scale: f32,
}

impl<'a> TileCanvas<'a> {
    pub fn new(view: PixelViewMut<'a>, x: i32, y: i32, scale: f32) -> TileCanvas<'a> {
        let origin = Point2D::new((x * view.size.width) as f32, (y * view.size.height) as f32);
        TileCanvas { view, origin, scale }
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn size(&self) -> Size2D<i32> {
        self.view.size
    }

    /// The area of the page covered by this tile, in content coordinates.
    pub fn content_rect(&self) -> FloatRect {
        FloatRect::new(
            Point2D::new(self.origin.x / self.scale, self.origin.y / self.scale),
            Size2D::new(self.view.size.width as f32 / self.scale,
                        self.view.size.height as f32 / self.scale),
        )
    }

    pub fn stride(&self) -> usize {
        self.view.stride
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut *self.view.pixels
    }

    pub fn erase(&mut self, color: Color) {
        let size = self.view.size;
        self.fill_pixels(0, 0, size.width, size.height, color.to_rgba8());
    }

    pub fn fill_rect(&mut self, rect: &FloatRect, color: Color) {
        let left = (rect.origin.x * self.scale - self.origin.x).round() as i32;
        let top = (rect.origin.y * self.scale - self.origin.y).round() as i32;
        let right = ((rect.origin.x + rect.size.width) * self.scale - self.origin.x).round() as i32;
        let bottom = ((rect.origin.y + rect.size.height) * self.scale - self.origin.y).round() as i32;
        self.fill_pixels(left, top, right, bottom, color.to_rgba8());
    }

    fn fill_pixels(&mut self, left: i32, top: i32, right: i32, bottom: i32, rgba: [u8; 4]) {
        let left = left.max(0) as usize;
        let top = top.max(0) as usize;
        let right = right.min(self.view.size.width).max(0) as usize;
        let bottom = bottom.min(self.view.size.height).max(0) as usize;
        for row in top .. bottom {
            let start = row * self.view.stride;
            for pixel in self.view.pixels[start + left * 4 .. start + right * 4].chunks_mut(4) {
                pixel.copy_from_slice(&rgba);
            }
        }
    }
}

pub struct TileRenderInfo<'a> {
    pub x: i32,
    pub y: i32,
    pub scale: f32,
    pub background: Color,
    pub painter: &'a dyn TilePainter,
    pub show_visual_indicator: bool,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct TileContentHints {
    pub did_render: bool,
    pub has_alpha: bool,
    pub is_pure_color: bool,
    pub pure_color: Color,
}

impl Default for TileContentHints {
    fn default() -> TileContentHints {
        TileContentHints {
            did_render: false,
            has_alpha: true,
            is_pure_color: false,
            pure_color: Color::transparent(),
        }
    }
}

/// Rasterizes tile content and hands it over to tile textures. One
/// renderer belongs to one texture generator thread.
pub trait BaseRenderer: Send {
    fn rendered_content_needs_flip_y(&self) -> bool {
        false
    }

    fn render_tiled_content(&mut self, info: &TileRenderInfo) -> TileContentHints;

    /// Moves the last rendered content into `texture`.
    fn commit_rendered_content_to_tile_texture(&mut self, texture: &TileTexture);
}

/// Paints tiles in software into a mapped buffer.
pub struct RasterRenderer {
    limits: Arc<ResourceLimits>,
    tile_size: i32,
    render_buffer: Option<MappedTexture>,
    update_count: u64,
}

impl RasterRenderer {
    pub fn new(limits: &Arc<ResourceLimits>, tile_size: i32) -> RasterRenderer {
        RasterRenderer {
            limits: Arc::clone(limits),
            tile_size,
            render_buffer: None,
            update_count: 0,
        }
    }
}

impl BaseRenderer for RasterRenderer {
    fn render_tiled_content(&mut self, info: &TileRenderInfo) -> TileContentHints {
        let mut hints = TileContentHints::default();

        if self.render_buffer.is_none() {
            self.render_buffer = MappedTexture::new(&self.limits,
                                                    ResourceContext::System,
                                                    Size2D::new(self.tile_size, self.tile_size),
                                                    PixelFormat::HasAlpha,
                                                    WriteMode::SOFTWARE);
        }
        let buffer = match self.render_buffer {
            Some(ref mut buffer) => buffer,
            None => {
                warn!("no buffer to paint tile {}, {} into", info.x, info.y);
                return hints;
            }
        };

        if let Some(view) = buffer.lock_buffer_for_writing() {
            let mut canvas = TileCanvas::new(view, info.x, info.y, info.scale);
            canvas.erase(info.background);

            let start = precise_time_ns();
            hints.did_render = info.painter.paint(&mut canvas);
            let render_ns = precise_time_ns() - start;

            hints.has_alpha = info.background.has_alpha();
            if hints.did_render {
                let size = canvas.size();
                let stride = canvas.stride();
                if let Some(color) = detect_pure_color(canvas.pixels_mut(), size, stride) {
                    hints.is_pure_color = true;
                    hints.pure_color = color;
                }
            }

            if info.show_visual_indicator {
                self.update_count += 1;
                draw_tile_info(&mut canvas, self.update_count, render_ns);
                hints.is_pure_color = false;
            }
        }
        buffer.unlock_buffer();

        hints
    }

    fn commit_rendered_content_to_tile_texture(&mut self, texture: &TileTexture) {
        let needs_flip_y = self.rendered_content_needs_flip_y();
        texture.swap_buffer(&mut self.render_buffer, needs_flip_y);
    }
}

/// Frames the tile. The frame gets redder the longer the paint took and
/// its thickness cycles with the update count.
fn draw_tile_info(canvas: &mut TileCanvas, update_count: u64, render_ns: u64) {
    let size = canvas.size();
    let thickness = 1 + (update_count % 4) as i32;
    let slowness = (render_ns as f64 / 16000000.0).min(1.0) as f32;
    let rgba = Color::new(slowness, 1.0 - slowness, 0.0, 1.0).to_rgba8();
    canvas.fill_pixels(0, 0, size.width, thickness, rgba);
    canvas.fill_pixels(0, size.height - thickness, size.width, size.height, rgba);
    canvas.fill_pixels(0, 0, thickness, size.height, rgba);
    canvas.fill_pixels(size.width - thickness, 0, size.width, size.height, rgba);
}

fn cluster_order(cluster_count: usize) -> Vec<usize> {
    if cluster_count == 0 {
        return Vec::new();
    }
    let increment = if cluster_count % CLUSTER_INCREMENT != 0 { CLUSTER_INCREMENT } else { 1 };
    let first = cluster_count / 4;
    let mut order = Vec::with_capacity(cluster_count);
    let mut index = first;
    loop {
        order.push(index);
        index = (index + increment) % cluster_count;
        if index == first {
            return order;
        }
    }
}

fn read_word(bytes: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(bytes);
    u64::from_ne_bytes(word)
}

/// Returns the color of the buffer if every pixel has the same value.
///
/// Rows are scanned in clusters of eight visited in a scattered order, two
/// pixels at a time, bailing out as soon as a run of pixels disagrees.
pub fn detect_pure_color(pixels: &[u8], size: Size2D<i32>, stride: usize) -> Option<Color> {
    let width = size.width.max(0) as usize;
    let height = size.height.max(0) as usize;
    if width < 2 || height == 0 || pixels[0 .. 4] != pixels[4 .. 8] {
        return None;
    }

    let first = Color::from_rgba8(pixels[0], pixels[1], pixels[2], pixels[3]);
    if width % RUN_PIXELS != 0 || height % CLUSTER_HEIGHT != 0 {
        let reference = &pixels[0 .. 4];
        for row in 0 .. height {
            let start = row * stride;
            if pixels[start .. start + width * 4].chunks(4).any(|pixel| pixel != reference) {
                return None;
            }
        }
        return Some(first);
    }

    let cluster_count = height / CLUSTER_HEIGHT;
    let computed;
    let order: &[usize] = if cluster_count == TILE_CLUSTER_ORDER.len() {
        &TILE_CLUSTER_ORDER[..]
    } else {
        computed = cluster_order(cluster_count);
        &computed[..]
    };

    let mut and_reduction = !0u64;
    let mut or_reduction = 0u64;
    for &cluster in order {
        for y in cluster * CLUSTER_HEIGHT .. (cluster + 1) * CLUSTER_HEIGHT {
            let row = &pixels[y * stride .. y * stride + width * 4];
            for run in row.chunks(RUN_PIXELS * 4) {
                for bytes in run.chunks(8) {
                    let value = read_word(bytes);
                    and_reduction &= value;
                    or_reduction |= value;
                }
                if and_reduction != or_reduction {
                    return None;
                }
            }
        }
    }

    Some(first)
}
