/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use crate::device::{TextureFilter, TextureId, TextureTarget};
use crate::util::{FloatRect, Matrix};
use euclid::{Point2D, Rect, Size2D};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DrawQuadType {
    /// Base layer content, positioned by geometry alone.
    Base,
    /// Layer content, positioned by the layer transform and geometry.
    Layer,
    /// A 1:1 pixel blit over the whole target.
    Blit,
}

/// A non-premultiplied RGBA color with components in [0, 1].
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub fn new(r: f32, g: f32, b: f32, a: f32) -> Color {
        Color { r, g, b, a }
    }

    pub fn from_rgba8(r: u8, g: u8, b: u8, a: u8) -> Color {
        Color::new(r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0, a as f32 / 255.0)
    }

    pub fn transparent() -> Color {
        Color::new(0.0, 0.0, 0.0, 0.0)
    }

    pub fn has_alpha(&self) -> bool {
        self.a < 1.0
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }

    pub fn to_rgba8(&self) -> [u8; 4] {
        let channel = |c: f32| (c.max(0.0).min(1.0) * 255.0).round() as u8;
        [channel(self.r), channel(self.g), channel(self.b), channel(self.a)]
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct DrawQuadData {
    pub quad_type: DrawQuadType,
    pub draw_matrix: Option<Matrix>,
    pub geometry: FloatRect,
    pub opacity: f32,
    /// The part of the unit square, in texture coordinates, to fill.
    pub fill_portion: FloatRect,
}

impl DrawQuadData {
    pub fn new(quad_type: DrawQuadType,
               draw_matrix: Option<Matrix>,
               geometry: FloatRect,
               opacity: f32)
               -> DrawQuadData {
        DrawQuadData {
            quad_type,
            draw_matrix,
            geometry,
            opacity,
            fill_portion: Rect::new(Point2D::zero(), Size2D::new(1.0, 1.0)),
        }
    }

    pub fn with_fill_portion(mut self, fill_portion: FloatRect) -> DrawQuadData {
        self.fill_portion = fill_portion;
        self
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct PureColorQuadData {
    pub quad: DrawQuadData,
    pub color: Color,
}

impl PureColorQuadData {
    pub fn new(quad: DrawQuadData, color: Color) -> PureColorQuadData {
        PureColorQuadData { quad, color }
    }
}

bitflags! {
    pub struct ContentFlags: u32 {
        const HAS_NO_ALPHA = 1 << 0;
        const ALPHA_NOT_PREMULTIPLIED = 1 << 1;
        const CAN_DEFER_RENDERING = 1 << 2;
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct TextureQuadData {
    pub quad: DrawQuadData,
    pub texture: TextureId,
    pub target: TextureTarget,
    pub filter: TextureFilter,
    pub flags: ContentFlags,
    /// Tiles the texture this many times over the quad.
    pub repeat_scale: Option<Size2D<f32>>,
}

impl TextureQuadData {
    pub fn new(quad: DrawQuadData,
               texture: TextureId,
               target: TextureTarget,
               filter: TextureFilter,
               flags: ContentFlags)
               -> TextureQuadData {
        TextureQuadData {
            quad,
            texture,
            target,
            filter,
            flags,
            repeat_scale: None,
        }
    }

    pub fn with_repeat_scale(mut self, repeat_scale: Size2D<f32>) -> TextureQuadData {
        if repeat_scale.width > 0.0 && repeat_scale.height > 0.0 {
            self.repeat_scale = Some(repeat_scale);
        }
        self
    }

    pub fn has_alpha(&self) -> bool {
        !self.flags.contains(ContentFlags::HAS_NO_ALPHA)
    }

    pub fn has_premultiplied_alpha(&self) -> bool {
        !self.flags.contains(ContentFlags::ALPHA_NOT_PREMULTIPLIED)
    }

    pub fn can_defer_rendering(&self) -> bool {
        self.flags.contains(ContentFlags::CAN_DEFER_RENDERING)
    }
}
