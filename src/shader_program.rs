/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Projection set-up and quad drawing for one composited frame.
//!
//! Quads whose final transform only translates and scales are handed to the
//! `BlendingTree` and drawn in batches on `flush_drawing`. Everything else is
//! drawn immediately with one of a fixed set of shaders, after flushing the
//! pending batch so overlapping quads keep their order.

use crate::blending_tree::{BlendingTree, TransferMode};
use crate::device::{BlendFactor, Device, DeviceLimits, Primitive, ProgramId, TextureId};
use crate::device::{TextureTarget, UniformLocation, VboId};
use crate::draw_quad_data::{Color, DrawQuadData, DrawQuadType, PureColorQuadData};
use crate::draw_quad_data::TextureQuadData;
use crate::options::RendererOptions;
use crate::util::{enclosing_int_rect, intersect_rects, orthographic_projection, to_float_rect};
use crate::util::{FloatRect, IntRect, Matrix, MatrixHelpers, RectHelpers};
use euclid::{Point2D, Rect, Size2D, Transform3D};

const EPSILON: f32 = 0.00001;
const Z_NEAR: f32 = -1000.0;
const Z_FAR: f32 = 1000.0;
const MAX_CONTRAST: f32 = 5.0;

/// Vertex positions of the unit quad, drawn as a triangle strip.
const QUAD_VERTICES: [f32; 8] = [0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0];
const POSITION_ATTRIBUTE: u32 = 0;

/// Run once the texture handed to a draw is no longer needed by GL.
pub type DrawCallback = Box<dyn FnOnce(&mut dyn Device)>;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ShaderKind {
    PureColor,
    Tex2D,
    Tex2DInv,
    TexOES,
    TexOESInv,
    Video,
    RepeatTex2D,
    RepeatTex2DInv,
}

impl ShaderKind {
    pub const ALL: [ShaderKind; 8] = [
        ShaderKind::PureColor,
        ShaderKind::Tex2D,
        ShaderKind::Tex2DInv,
        ShaderKind::TexOES,
        ShaderKind::TexOESInv,
        ShaderKind::Video,
        ShaderKind::RepeatTex2D,
        ShaderKind::RepeatTex2DInv,
    ];

    fn index(&self) -> usize {
        *self as usize
    }

    pub fn name(&self) -> &'static str {
        match *self {
            ShaderKind::PureColor => "pure_color",
            ShaderKind::Tex2D => "tex_2d",
            ShaderKind::Tex2DInv => "tex_2d_inverted",
            ShaderKind::TexOES => "tex_oes",
            ShaderKind::TexOESInv => "tex_oes_inverted",
            ShaderKind::Video => "video",
            ShaderKind::RepeatTex2D => "repeat_tex_2d",
            ShaderKind::RepeatTex2DInv => "repeat_tex_2d_inverted",
        }
    }

    pub fn has_contrast(&self) -> bool {
        match *self {
            ShaderKind::Tex2DInv | ShaderKind::TexOESInv | ShaderKind::RepeatTex2DInv => true,
            _ => false,
        }
    }

    pub fn is_repeat(&self) -> bool {
        match *self {
            ShaderKind::RepeatTex2D | ShaderKind::RepeatTex2DInv => true,
            _ => false,
        }
    }

    fn is_external(&self) -> bool {
        match *self {
            ShaderKind::TexOES | ShaderKind::TexOESInv | ShaderKind::Video => true,
            _ => false,
        }
    }

    /// Only the plain 2D texture shader can be expressed by the blending
    /// tree's generated programs.
    pub fn can_defer_rendering(&self, data: &TextureQuadData) -> bool {
        *self == ShaderKind::Tex2D &&
            data.target == TextureTarget::Default &&
            data.can_defer_rendering()
    }

    fn vertex_source(&self) -> &'static str {
        match *self {
            ShaderKind::PureColor => PURE_COLOR_VERTEX_SHADER,
            ShaderKind::Video => VIDEO_VERTEX_SHADER,
            _ => TEXTURE_VERTEX_SHADER,
        }
    }

    fn fragment_source(&self) -> String {
        match *self {
            ShaderKind::PureColor => return PURE_COLOR_FRAGMENT_SHADER.to_owned(),
            ShaderKind::Video => return VIDEO_FRAGMENT_SHADER.to_owned(),
            _ => {}
        }

        let mut source = String::new();
        if self.is_external() {
            source.push_str("#extension GL_OES_EGL_image_external : require\n");
        }
        source.push_str("precision mediump float;\n");
        source.push_str("varying vec2 v_texCoord;\n");
        source.push_str("uniform float alpha;\n");
        if self.has_contrast() {
            source.push_str("uniform float contrast;\n");
        }
        if self.is_external() {
            source.push_str("uniform samplerExternalOES s_texture;\n");
        } else {
            source.push_str("uniform sampler2D s_texture;\n");
        }
        if self.is_repeat() {
            source.push_str("uniform vec2 repeatScale;\n");
        }
        source.push_str("void main() {\n");
        if self.is_repeat() {
            source.push_str("  vec2 texCoord = fract(v_texCoord) * repeatScale;\n");
        } else {
            source.push_str("  vec2 texCoord = v_texCoord;\n");
        }
        source.push_str("  vec4 pixel = texture2D(s_texture, texCoord);\n");
        if self.has_contrast() {
            source.push_str("  float a = pixel.a;\n");
            source.push_str("  float color = a - (0.2989 * pixel.r + 0.5866 * pixel.g + 0.1145 * pixel.b);\n");
            source.push_str("  color = ((color - a / 2.0) * contrast) + a / 2.0;\n");
            source.push_str("  pixel.rgb = vec3(color, color, color);\n");
        }
        source.push_str("  gl_FragColor = pixel * alpha;\n");
        source.push_str("}\n");
        source
    }
}

const TEXTURE_VERTEX_SHADER: &str = "\
attribute vec4 vPosition;
uniform mat4 projectionMatrix;
uniform vec4 fillPortion;
varying vec2 v_texCoord;
void main() {
  gl_Position = projectionMatrix * vPosition;
  v_texCoord = vPosition.xy * fillPortion.zw + fillPortion.xy;
}
";

const PURE_COLOR_VERTEX_SHADER: &str = "\
attribute vec4 vPosition;
uniform mat4 projectionMatrix;
uniform vec4 inputColor;
varying vec4 v_color;
void main() {
  gl_Position = projectionMatrix * vPosition;
  v_color = inputColor;
}
";

const PURE_COLOR_FRAGMENT_SHADER: &str = "\
precision mediump float;
varying vec4 v_color;
void main() {
  gl_FragColor = v_color;
}
";

const VIDEO_VERTEX_SHADER: &str = "\
attribute vec4 vPosition;
uniform mat4 textureMatrix;
uniform mat4 projectionMatrix;
varying vec2 v_texCoord;
void main() {
  gl_Position = projectionMatrix * vPosition;
  v_texCoord = vec2(textureMatrix * vec4(vPosition.x, 1.0 - vPosition.y, 0.0, 1.0));
}
";

const VIDEO_FRAGMENT_SHADER: &str = "\
#extension GL_OES_EGL_image_external : require
precision mediump float;
uniform samplerExternalOES s_yuvTexture;
varying vec2 v_texCoord;
void main() {
  gl_FragColor = texture2D(s_yuvTexture, v_texCoord);
}
";

lazy_static! {
    static ref FRAGMENT_SOURCES: Vec<String> =
        ShaderKind::ALL.iter().map(|kind| kind.fragment_source()).collect();
}

struct CompiledShader {
    program: ProgramId,
    projection: UniformLocation,
    alpha: UniformLocation,
    sampler: UniformLocation,
    contrast: UniformLocation,
    fill_portion: UniformLocation,
    repeat_scale: UniformLocation,
    color: UniformLocation,
    texture_matrix: UniformLocation,
}

impl CompiledShader {
    fn new(device: &mut dyn Device, kind: ShaderKind) -> Option<CompiledShader> {
        let program = match device.create_program(kind.name(),
                                                  kind.vertex_source(),
                                                  &FRAGMENT_SOURCES[kind.index()],
                                                  &[(POSITION_ATTRIBUTE, "vPosition")]) {
            Ok(program) => program,
            Err(err) => {
                error!("{}", err);
                return None;
            }
        };

        let textured = kind != ShaderKind::PureColor && kind != ShaderKind::Video;
        let sampler_name = if kind == ShaderKind::Video { "s_yuvTexture" } else { "s_texture" };
        let mut location = |name: &str, present: bool| {
            if present {
                device.uniform_location(program, name)
            } else {
                UniformLocation::invalid()
            }
        };

        Some(CompiledShader {
            program,
            projection: location("projectionMatrix", true),
            alpha: location("alpha", textured),
            sampler: location(sampler_name, kind != ShaderKind::PureColor),
            contrast: location("contrast", kind.has_contrast()),
            fill_portion: location("fillPortion", textured),
            repeat_scale: location("repeatScale", kind.is_repeat()),
            color: location("inputColor", kind == ShaderKind::PureColor),
            texture_matrix: location("textureMatrix", kind == ShaderKind::Video),
        })
    }
}

/// Draw state handed over by the view system at the start of a frame.
#[derive(Debug, Copy, Clone)]
pub struct DrawInfo {
    pub transform: Matrix,
    pub is_layer: bool,
    pub target_height: i32,
}

pub struct ShaderProgram {
    shaders: Vec<CompiledShader>,
    quad_buffer: Option<VboId>,
    needs_init: bool,

    inverted_screen: bool,
    contrast: f32,
    blending_enabled: bool,
    using_premultiplied_alpha: bool,

    surface_projection: Matrix,
    clip_projection: Matrix,
    visible_content_projection: Matrix,
    transfer_projection: Matrix,
    web_view_matrix: Matrix,
    content_to_inv_view: Matrix,
    content_to_view: Matrix,
    current_scale: f32,
    alpha_layer: bool,
    target_height: i32,

    visible_content_rect: FloatRect,
    content_viewport: FloatRect,
    screen_rect: IntRect,
    inv_screen_rect: IntRect,
    screen_viewport: IntRect,
    inv_view_clip: IntRect,
    title_bar_height: i32,
    clip_rect: Option<FloatRect>,
    scissor: Option<IntRect>,

    deferred_quads: BlendingTree,
    finished_drawing_callbacks: Vec<DrawCallback>,
}

impl ShaderProgram {
    pub fn new(options: &RendererOptions, limits: &DeviceLimits) -> ShaderProgram {
        let mut shader_program = ShaderProgram {
            shaders: Vec::new(),
            quad_buffer: None,
            needs_init: true,
            inverted_screen: options.inverted_screen,
            contrast: 1.0,
            blending_enabled: false,
            using_premultiplied_alpha: true,
            surface_projection: Transform3D::identity(),
            clip_projection: Transform3D::identity(),
            // Maps the unit square until set_up_drawing provides a viewport.
            visible_content_projection: orthographic_projection(0.0, 1.0, 1.0, 0.0, Z_NEAR, Z_FAR),
            transfer_projection: Transform3D::create_scale(2.0, 2.0, 1.0)
                .translated(-0.5, -0.5, 0.0),
            web_view_matrix: Transform3D::identity(),
            content_to_inv_view: Transform3D::identity(),
            content_to_view: Transform3D::identity(),
            current_scale: 1.0,
            alpha_layer: false,
            target_height: 0,
            visible_content_rect: FloatRect::zero(),
            content_viewport: FloatRect::zero(),
            screen_rect: IntRect::zero(),
            inv_screen_rect: IntRect::zero(),
            screen_viewport: IntRect::zero(),
            inv_view_clip: IntRect::zero(),
            title_bar_height: 0,
            clip_rect: None,
            scissor: None,
            deferred_quads: BlendingTree::new(limits),
            finished_drawing_callbacks: Vec::new(),
        };
        shader_program.set_contrast(options.inverted_screen_contrast);
        shader_program
    }

    pub fn needs_init(&self) -> bool {
        self.needs_init
    }

    /// Builds every shader and the shared quad buffer. Leaves the program
    /// marked as needing init if any shader fails to build.
    pub fn init_gl_resources(&mut self, device: &mut dyn Device) -> bool {
        self.cleanup_gl_resources(device);

        let mut shaders = Vec::with_capacity(ShaderKind::ALL.len());
        for kind in &ShaderKind::ALL {
            match CompiledShader::new(device, *kind) {
                Some(shader) => shaders.push(shader),
                None => {
                    for shader in shaders {
                        device.delete_program(shader.program);
                    }
                    self.needs_init = true;
                    return false;
                }
            }
        }

        self.shaders = shaders;
        self.quad_buffer = Some(device.create_vertex_buffer(&QUAD_VERTICES));
        self.needs_init = false;
        true
    }

    pub fn cleanup_gl_resources(&mut self, device: &mut dyn Device) {
        for shader in self.shaders.drain(..) {
            device.delete_program(shader.program);
        }
        if let Some(buffer) = self.quad_buffer.take() {
            device.delete_vertex_buffer(buffer);
        }
        self.needs_init = true;
        self.deferred_quads.cleanup_gl_resources(device);
    }

    /// Forgets every GL name after the context was reset.
    pub fn did_reset_rendering_context(&mut self) {
        self.shaders.clear();
        self.quad_buffer = None;
        self.deferred_quads.did_reset_rendering_context();
        self.needs_init = true;
        self.blending_enabled = false;
        self.scissor = None;
        self.clip_rect = None;
    }

    pub fn set_inverted_screen(&mut self, inverted: bool) {
        self.inverted_screen = inverted;
    }

    pub fn contrast(&self) -> f32 {
        self.contrast
    }

    pub fn set_contrast(&mut self, contrast: f32) {
        self.contrast = contrast.max(0.0).min(MAX_CONTRAST);
    }

    pub fn current_scale(&self) -> f32 {
        self.current_scale
    }

    pub fn content_viewport(&self) -> FloatRect {
        self.content_viewport
    }

    pub fn screen_viewport(&self) -> IntRect {
        self.screen_viewport
    }

    pub fn is_alpha_layer(&self) -> bool {
        self.alpha_layer
    }

    pub fn set_gl_draw_info(&mut self, info: &DrawInfo) {
        self.web_view_matrix = info.transform;
        self.alpha_layer = info.is_layer;
        self.target_height = info.target_height;
    }

    pub fn set_up_drawing(&mut self,
                          device: &mut dyn Device,
                          inv_screen_rect: IntRect,
                          visible_content_rect: FloatRect,
                          screen_rect: IntRect,
                          title_bar_height: i32,
                          screen_clip: IntRect,
                          scale: f32) {
        self.screen_rect = screen_rect;
        self.title_bar_height = title_bar_height;

        // Both projections flip y: content space grows downwards, GL upwards.
        self.visible_content_projection =
            orthographic_projection(visible_content_rect.min_x(),
                                    visible_content_rect.max_x(),
                                    visible_content_rect.max_y(),
                                    visible_content_rect.min_y(),
                                    Z_NEAR,
                                    Z_FAR);
        let clip = to_float_rect(&screen_clip);
        self.clip_projection =
            orthographic_projection(clip.min_x(), clip.max_x(), clip.max_y(), clip.min_y(),
                                    Z_NEAR, Z_FAR);

        self.screen_viewport = Rect::new(
            Point2D::new(screen_clip.origin.x,
                         self.target_height - screen_clip.origin.y - screen_clip.size.height),
            screen_clip.size,
        );
        self.deferred_quads.set_viewport(self.screen_viewport);
        device.set_viewport(self.screen_viewport);

        self.visible_content_rect = visible_content_rect;
        self.current_scale = scale;
        self.inv_screen_rect = inv_screen_rect;

        let view_scale = Transform3D::create_scale(inv_screen_rect.size.width as f32 * 0.5,
                                                   inv_screen_rect.size.height as f32 * 0.5,
                                                   1.0);
        let view_translate = Transform3D::create_translation(1.0, 1.0, 0.0);
        self.content_to_inv_view = view_scale
            .pre_mul(&view_translate)
            .pre_mul(&self.visible_content_projection);
        self.content_to_view = view_scale
            .pre_mul(&view_translate.scaled(1.0, -1.0, 1.0))
            .pre_mul(&self.visible_content_projection);

        let inv_view_rect = Rect::new(Point2D::zero(),
                                      Size2D::new(screen_rect.size.width as f32,
                                                  screen_rect.size.height as f32));
        self.content_viewport = match self.content_to_inv_view.inverse() {
            Some(inverse) => inverse.map_axis_aligned_rect(&inv_view_rect),
            None => visible_content_rect,
        };

        // The screen clip arrives in screen coordinates. Move it into view
        // coordinates, then into inverted view coordinates, which is what
        // `clip` intersects against.
        let view_clip = Rect::new(
            Point2D::new((screen_clip.origin.x - screen_rect.origin.x) as f32,
                         (screen_clip.origin.y - screen_rect.origin.y - title_bar_height) as f32),
            Size2D::new(screen_clip.size.width as f32, screen_clip.size.height as f32),
        );
        let inv_view_clip = self.convert_view_coord_to_inv_view_coord(&view_clip);
        self.inv_view_clip = Rect::new(
            Point2D::new(inv_view_clip.origin.x as i32, inv_view_clip.origin.y as i32),
            // Rounding up absorbs the view -> content -> view round trip error.
            Size2D::new(inv_view_clip.size.width.ceil() as i32,
                        inv_view_clip.size.height.ceil() as i32),
        );
        self.clip_rect = None;

        self.reset_blending(device);
        self.set_up_surface_projection();
    }

    fn set_up_surface_projection(&mut self) {
        let scale = Transform3D::create_scale(self.current_scale, self.current_scale, 1.0);
        self.surface_projection = self.clip_projection
            .pre_mul(&self.web_view_matrix)
            .pre_mul(&scale);
    }

    fn reset_blending(&mut self, device: &mut dyn Device) {
        device.set_blend_enabled(false);
        device.set_blend_func(BlendFactor::One, BlendFactor::OneMinusSrcAlpha);
        device.set_blend_equation_add();
        self.blending_enabled = false;
        self.using_premultiplied_alpha = true;
    }

    fn set_blending_state(&mut self,
                          device: &mut dyn Device,
                          enable: bool,
                          uses_premultiplied_alpha: bool) {
        if enable && uses_premultiplied_alpha != self.using_premultiplied_alpha {
            let src = if uses_premultiplied_alpha {
                BlendFactor::One
            } else {
                BlendFactor::SrcAlpha
            };
            device.set_blend_func(src, BlendFactor::OneMinusSrcAlpha);
            self.using_premultiplied_alpha = uses_premultiplied_alpha;
        }

        if enable == self.blending_enabled {
            return;
        }
        device.set_blend_enabled(enable);
        self.blending_enabled = enable;
    }

    /// The color actually sent to the shader, with opacity folded in and the
    /// inverted-screen filter applied.
    pub fn shader_color(&self, color: &Color, opacity: f32) -> Color {
        if self.inverted_screen {
            let a = color.a;
            let mut intensity = a - (0.2989 * color.r + 0.5866 * color.g + 0.1145 * color.b);
            intensity = ((intensity - a / 2.0) * self.contrast) + a / 2.0;
            intensity *= opacity;
            return Color::new(intensity, intensity, intensity, a * opacity);
        }
        Color::new(color.r * opacity, color.g * opacity, color.b * opacity, color.a * opacity)
    }

    pub fn texture_shader_for(&self, data: &TextureQuadData) -> ShaderKind {
        match (data.target, self.inverted_screen, data.repeat_scale.is_some()) {
            (TextureTarget::Default, false, false) => ShaderKind::Tex2D,
            (TextureTarget::Default, false, true) => ShaderKind::RepeatTex2D,
            (TextureTarget::Default, true, false) => ShaderKind::Tex2DInv,
            (TextureTarget::Default, true, true) => ShaderKind::RepeatTex2DInv,
            (TextureTarget::External, false, _) => ShaderKind::TexOES,
            (TextureTarget::External, true, _) => ShaderKind::TexOESInv,
        }
    }

    /// The matrix taking the unit square to clip space for this quad.
    pub fn tile_projection_matrix(&self, data: &DrawQuadData) -> Matrix {
        if data.quad_type == DrawQuadType::Blit {
            return self.transfer_projection;
        }

        let geometry = &data.geometry;
        let fill = &data.fill_portion;
        let base = match (data.quad_type, data.draw_matrix) {
            (DrawQuadType::Layer, Some(matrix)) => matrix,
            _ => Transform3D::identity(),
        };
        let modified = base
            .translated(geometry.origin.x + geometry.size.width * fill.origin.x,
                        geometry.origin.y + geometry.size.height * fill.origin.y,
                        0.0)
            .scaled(geometry.size.width * fill.size.width,
                    geometry.size.height * fill.size.height,
                    1.0);
        self.surface_projection.pre_mul(&modified)
    }

    /// The drawable part of clip space, or `None` if the scissor hides
    /// everything.
    pub fn viewport_clip_rect(&self) -> Option<FloatRect> {
        let clip_rect = Rect::new(Point2D::new(-1.0, -1.0), Size2D::new(2.0, 2.0));
        let scissor = match self.scissor {
            Some(scissor) => scissor,
            None => return Some(clip_rect),
        };
        let viewport = to_float_rect(&self.screen_viewport);
        if viewport.size.width <= 0.0 || viewport.size.height <= 0.0 {
            return Some(clip_rect);
        }
        let center_x = viewport.origin.x + viewport.size.width / 2.0;
        let center_y = viewport.origin.y + viewport.size.height / 2.0;
        let sx = 2.0 / viewport.size.width;
        let sy = 2.0 / viewport.size.height;
        let scissor_rect = Rect::new(
            Point2D::new((scissor.origin.x as f32 - center_x) * sx,
                         (scissor.origin.y as f32 - center_y) * sy),
            Size2D::new(scissor.size.width as f32 * sx, scissor.size.height as f32 * sy),
        );
        intersect_rects(&clip_rect, &scissor_rect)
    }

    fn use_shader(&self, device: &mut dyn Device, kind: ShaderKind) -> Option<&CompiledShader> {
        let shader = self.shaders.get(kind.index());
        match (shader, self.quad_buffer) {
            (Some(shader), Some(buffer)) => {
                device.use_program(shader.program);
                device.bind_vertex_buffer(buffer, POSITION_ATTRIBUTE, 2);
                Some(shader)
            }
            _ => {
                warn!("drawing with {} before shaders were built", kind.name());
                None
            }
        }
    }

    pub fn draw_color_quad(&mut self, device: &mut dyn Device, data: &PureColorQuadData) {
        let render = self.tile_projection_matrix(&data.quad);
        let unit = unit_rect();
        let dest = match self.viewport_clip_rect()
            .and_then(|clip| intersect_rects(&render.map_axis_aligned_rect(&unit), &clip)) {
            Some(dest) => dest,
            None => return,
        };

        let color = self.shader_color(&data.color, data.quad.opacity);
        if color.a <= 0.0 {
            return;
        }

        if render.is_translations_and_scales() {
            if !self.deferred_quads.can_accept_more_quads() {
                self.flush_drawing(device);
            }
            let transfer_mode = if color.has_alpha() {
                TransferMode::PremultipliedAlphaBlend
            } else {
                TransferMode::StraightCopy
            };
            self.deferred_quads.insert_color(color.to_array(), &dest, transfer_mode);
            return;
        }

        self.flush_drawing(device);
        self.set_blending_state(device, color.has_alpha(), true);
        if let Some(shader) = self.use_shader(device, ShaderKind::PureColor) {
            device.set_uniform_mat4(shader.projection, &render);
            device.set_uniform_vec4(shader.color, color.to_array());
            device.draw_arrays(Primitive::TriangleStrip, 0, 4);
        }
    }

    /// Draws a texture quad. `callback` runs once GL no longer needs the
    /// texture, which for batched quads is the next flush.
    pub fn draw_texture_quad(&mut self,
                             device: &mut dyn Device,
                             data: &TextureQuadData,
                             callback: Option<DrawCallback>) {
        let render = self.tile_projection_matrix(&data.quad);
        let dest = render.map_axis_aligned_rect(&unit_rect());
        let clip = match self.viewport_clip_rect() {
            Some(clip) if clip.intersects(&dest) => clip,
            _ => {
                if let Some(callback) = callback {
                    callback(device);
                }
                return;
            }
        };

        let kind = self.texture_shader_for(data);
        if render.is_translations_and_scales() && kind.can_defer_rendering(data) {
            if !self.deferred_quads.can_accept_more_quads() {
                self.flush_drawing(device);
            }
            let texgen = texture_generation_rect(&render, &dest, &data.quad.fill_portion);

            // A texture is never drawn twice in one batch with different
            // filters, so the filter can live on the texture object.
            device.bind_texture(0, TextureTarget::Default, data.texture);
            device.set_texture_filter(TextureTarget::Default, data.filter);

            let opacity = data.quad.opacity;
            let transfer_mode = if opacity == 1.0 && !data.has_alpha() {
                TransferMode::StraightCopy
            } else if data.has_alpha() && !data.has_premultiplied_alpha() {
                TransferMode::UnmultipliedAlphaBlend
            } else {
                TransferMode::PremultipliedAlphaBlend
            };

            let dest = intersect_rects(&dest, &clip).unwrap_or(dest);
            self.deferred_quads.insert_texture(data.texture, &dest, &texgen, opacity, transfer_mode);
            if let Some(callback) = callback {
                self.finished_drawing_callbacks.push(callback);
            }
            return;
        }

        self.flush_drawing(device);

        let enable_blending = data.has_alpha() || data.quad.opacity < 1.0;
        self.set_blending_state(device, enable_blending, data.has_premultiplied_alpha());

        let contrast = self.contrast;
        if let Some(shader) = self.use_shader(device, kind) {
            device.set_uniform_mat4(shader.projection, &render);

            device.set_uniform_int(shader.sampler, 0);
            device.bind_texture(0, data.target, data.texture);
            device.set_texture_filter(data.target, data.filter);
            device.set_uniform_float(shader.alpha, data.quad.opacity);
            if kind.has_contrast() {
                device.set_uniform_float(shader.contrast, contrast);
            }
            let fill = &data.quad.fill_portion;
            device.set_uniform_vec4(shader.fill_portion,
                                    [fill.origin.x, fill.origin.y, fill.size.width, fill.size.height]);
            if let (true, Some(repeat)) = (kind.is_repeat(), data.repeat_scale) {
                device.set_uniform_vec2(shader.repeat_scale, [repeat.width, repeat.height]);
            }

            device.draw_arrays(Primitive::TriangleStrip, 0, 4);
        }

        if let Some(callback) = callback {
            callback(device);
        }
    }

    pub fn draw_video_layer_quad(&mut self,
                                 device: &mut dyn Device,
                                 draw_matrix: &Matrix,
                                 texture_matrix: &Matrix,
                                 geometry: &FloatRect,
                                 texture: TextureId) {
        self.flush_drawing(device);

        let modified = Transform3D::create_scale(self.current_scale, self.current_scale, 1.0)
            .pre_mul(draw_matrix)
            .translated(geometry.origin.x, geometry.origin.y, 0.0)
            .scaled(geometry.size.width, geometry.size.height, 1.0);
        let render = self.clip_projection
            .pre_mul(&self.web_view_matrix)
            .pre_mul(&modified);

        if let Some(shader) = self.use_shader(device, ShaderKind::Video) {
            device.set_uniform_mat4(shader.projection, &render);
            device.set_uniform_mat4(shader.texture_matrix, texture_matrix);
            device.set_uniform_int(shader.sampler, 0);
            device.bind_texture(0, TextureTarget::External, texture);
        } else {
            return;
        }

        self.set_blending_state(device, false, true);
        device.draw_arrays(Primitive::TriangleStrip, 0, 4);
    }

    /// Fills the drawable area with `color`, replacing what is there.
    pub fn clear(&mut self, device: &mut dyn Device, color: [f32; 4]) {
        if !self.deferred_quads.can_accept_more_quads() {
            self.flush_drawing(device);
        }
        if let Some(clip) = self.viewport_clip_rect() {
            self.deferred_quads.insert_color(color, &clip, TransferMode::StraightCopy);
        }
    }

    /// Fills `rect`, in screen coordinates, with `color`.
    pub fn clear_rect_with_color(&mut self, device: &mut dyn Device, rect: &IntRect, color: [f32; 4]) {
        let scissor = self.scissor;
        self.scissor = Some(*rect);
        self.clear(device, color);
        self.scissor = scissor;
    }

    pub fn flush_drawing(&mut self, device: &mut dyn Device) {
        if !self.deferred_quads.is_empty() {
            self.deferred_quads.draw(device);
            self.deferred_quads.clear();
        }
        for callback in self.finished_drawing_callbacks.drain(..) {
            callback(device);
        }
    }

    pub fn pending_quad_count(&self) -> usize {
        self.deferred_quads.quad_count()
    }

    /// True if a tile painted at `tile_scale` lands on screen pixel for
    /// pixel, in which case nearest filtering gives a sharper result.
    pub fn use_point_sampling(&self, tile_scale: f32, layer_transform: Option<&Matrix>) -> bool {
        let mut matrix = Transform3D::create_scale(self.current_scale, self.current_scale, 1.0);
        if let Some(layer_transform) = layer_transform {
            matrix = matrix.pre_mul(layer_transform);
        }
        let matrix = self.web_view_matrix
            .pre_mul(&matrix.scaled(1.0 / tile_scale, 1.0 / tile_scale, 1.0));
        let rect = matrix.map_axis_aligned_rect(&unit_rect());
        (rect.size.width - 1.0).abs() < EPSILON && (rect.size.height - 1.0).abs() < EPSILON
    }

    /// Depth of the center of a `width` x `height` layer drawn with
    /// `draw_matrix`.
    pub fn z_value(&self, draw_matrix: &Matrix, width: f32, height: f32) -> f32 {
        let m = self.visible_content_projection.pre_mul(&draw_matrix.scaled(width, height, 1.0));
        let (x, y) = (0.5, 0.5);
        let z = x * m.m13 + y * m.m23 + m.m43;
        let w = x * m.m14 + y * m.m24 + m.m44;
        if w == 0.0 || w == 1.0 {
            z
        } else {
            z / w
        }
    }

    /// Scissors to `rect`, given in inverted view coordinates.
    pub fn clip(&mut self, device: &mut dyn Device, rect: &FloatRect) {
        if self.clip_rect == Some(*rect) {
            return;
        }

        let mut screen_clip = enclosing_int_rect(rect);
        if self.inv_view_clip.is_well_formed_and_nonempty() {
            screen_clip = intersect_rects(&screen_clip, &self.inv_view_clip)
                .unwrap_or_else(IntRect::zero);
        }

        screen_clip.origin.x += self.inv_screen_rect.origin.x;
        screen_clip.origin.y += self.inv_screen_rect.origin.y;
        if screen_clip.origin.x < 0 {
            screen_clip.size.width += screen_clip.origin.x;
            screen_clip.origin.x = 0;
        }
        if screen_clip.origin.y < 0 {
            screen_clip.size.height += screen_clip.origin.y;
            screen_clip.origin.y = 0;
        }

        device.set_scissor(Some(screen_clip));
        self.scissor = Some(screen_clip);
        self.clip_rect = Some(*rect);
    }

    pub fn clipped_rect_with_visible_content_rect(&self, rect: &IntRect, margin: i32) -> IntRect {
        let visible = &self.visible_content_rect;
        let viewport = Rect::new(
            Point2D::new(visible.origin.x as i32 - margin, visible.origin.y as i32 - margin),
            Size2D::new(visible.size.width as i32 + margin, visible.size.height as i32 + margin),
        );
        intersect_rects(&viewport, rect).unwrap_or_else(IntRect::zero)
    }

    /// Bounds of a `size` layer drawn with `draw_matrix`, in inverted view
    /// coordinates. Used for layer clip rects.
    pub fn rect_in_inv_view_coord_for(&self, draw_matrix: &Matrix, size: &Size2D<i32>) -> FloatRect {
        let rect = Rect::new(Point2D::zero(), Size2D::new(size.width as f32, size.height as f32));
        self.content_to_inv_view.pre_mul(draw_matrix).map_axis_aligned_rect(&rect)
    }

    /// Bounds of a `size` layer drawn with `draw_matrix`, in view
    /// coordinates. Used for partial screen invalidations.
    pub fn rect_in_view_coord_for(&self, draw_matrix: &Matrix, size: &Size2D<i32>) -> FloatRect {
        let rect = Rect::new(Point2D::zero(), Size2D::new(size.width as f32, size.height as f32));
        self.content_to_view.pre_mul(draw_matrix).map_axis_aligned_rect(&rect)
    }

    pub fn rect_in_view_coord(&self, rect: &FloatRect) -> FloatRect {
        self.content_to_view.map_axis_aligned_rect(rect)
    }

    pub fn rect_in_inv_view_coord(&self, rect: &FloatRect) -> FloatRect {
        self.content_to_inv_view.map_axis_aligned_rect(rect)
    }

    pub fn convert_inv_view_coord_to_content_coord(&self, rect: &FloatRect) -> FloatRect {
        inverse_or_identity(&self.content_to_inv_view).map_axis_aligned_rect(rect)
    }

    pub fn convert_view_coord_to_inv_view_coord(&self, rect: &FloatRect) -> FloatRect {
        let content = inverse_or_identity(&self.content_to_view).map_axis_aligned_rect(rect);
        self.rect_in_inv_view_coord(&content)
    }

    pub fn convert_inv_view_coord_to_view_coord(&self, rect: &FloatRect) -> FloatRect {
        let content = inverse_or_identity(&self.content_to_inv_view).map_axis_aligned_rect(rect);
        self.rect_in_view_coord(&content)
    }
}

fn unit_rect() -> FloatRect {
    Rect::new(Point2D::zero(), Size2D::new(1.0, 1.0))
}

fn inverse_or_identity(matrix: &Matrix) -> Matrix {
    matrix.inverse().unwrap_or_else(Transform3D::identity)
}

/// Maps clip space back to texture coordinates of the quad, honouring
/// mirrored axes.
fn texture_generation_rect(render: &Matrix, dest: &FloatRect, fill: &FloatRect) -> FloatRect {
    let (x, width) = if render.m11 > 0.0 {
        let width = fill.size.width / dest.size.width;
        (fill.origin.x - dest.min_x() * width, width)
    } else {
        let width = -fill.size.width / dest.size.width;
        (fill.origin.x - dest.max_x() * width, width)
    };
    let (y, height) = if render.m22 > 0.0 {
        let height = fill.size.height / dest.size.height;
        (fill.origin.y - dest.min_y() * height, height)
    } else {
        let height = -fill.size.height / dest.size.height;
        (fill.origin.y - dest.max_y() * height, height)
    };
    Rect::new(Point2D::new(x, y), Size2D::new(width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::TextureFilter;
    use crate::draw_quad_data::ContentFlags;
    use crate::recording_device::{RecordingDevice, UniformValue};
    use std::cell::Cell;
    use std::rc::Rc;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    fn screen() -> IntRect {
        Rect::new(Point2D::zero(), Size2D::new(800, 600))
    }

    fn set_up(options: &RendererOptions) -> (RecordingDevice, ShaderProgram) {
        let mut device = RecordingDevice::new();
        let mut program = ShaderProgram::new(options, &device.limits);
        assert!(program.init_gl_resources(&mut device));
        program.set_gl_draw_info(&DrawInfo {
            transform: Transform3D::identity(),
            is_layer: false,
            target_height: 600,
        });
        program.set_up_drawing(&mut device, screen(), to_float_rect(&screen()), screen(), 0,
                               screen(), 1.0);
        (device, program)
    }

    fn tile_quad(texture: TextureId, flags: ContentFlags, matrix: Option<Matrix>) -> TextureQuadData {
        let quad_type = if matrix.is_some() { DrawQuadType::Layer } else { DrawQuadType::Base };
        TextureQuadData::new(
            DrawQuadData::new(quad_type, matrix,
                              Rect::new(Point2D::new(0.0, 0.0), Size2D::new(256.0, 256.0)), 1.0),
            texture,
            TextureTarget::Default,
            TextureFilter::Linear,
            flags,
        )
    }

    fn counting_callback(count: &Rc<Cell<usize>>) -> Option<DrawCallback> {
        let count = Rc::clone(count);
        Some(Box::new(move |_: &mut dyn Device| count.set(count.get() + 1)))
    }

    #[test]
    fn builds_every_shader_kind() {
        let (device, program) = set_up(&RendererOptions::default());
        assert!(!program.needs_init());
        assert_eq!(device.programs.len(), ShaderKind::ALL.len());
        let oes = device.programs.values().find(|p| p.name == "tex_oes_inverted").unwrap();
        assert!(oes.fragment_source.starts_with("#extension GL_OES_EGL_image_external"));
        assert!(oes.fragment_source.contains("uniform float contrast;"));
        let repeat = device.programs.values().find(|p| p.name == "repeat_tex_2d").unwrap();
        assert!(repeat.fragment_source.contains("repeatScale"));
        assert!(!repeat.fragment_source.contains("contrast"));
    }

    #[test]
    fn failed_build_keeps_needing_init() {
        let mut device = RecordingDevice::new();
        device.fail_compiles = true;
        let mut program = ShaderProgram::new(&RendererOptions::default(), &device.limits);
        assert!(!program.init_gl_resources(&mut device));
        assert!(program.needs_init());
        assert!(device.programs.is_empty());
        assert!(device.vertex_buffers.is_empty());
    }

    #[test]
    fn contrast_is_clamped() {
        let device = RecordingDevice::new();
        let mut program = ShaderProgram::new(&RendererOptions::default(), &device.limits);
        program.set_contrast(9.0);
        assert_eq!(program.contrast(), 5.0);
        program.set_contrast(-1.0);
        assert_eq!(program.contrast(), 0.0);
    }

    #[test]
    fn blit_quads_cover_clip_space() {
        let (_, program) = set_up(&RendererOptions::default());
        let data = DrawQuadData::new(DrawQuadType::Blit, None, FloatRect::zero(), 1.0);
        let dest = program.tile_projection_matrix(&data).map_axis_aligned_rect(&unit_rect());
        assert!(approx(dest.origin.x, -1.0) && approx(dest.origin.y, -1.0));
        assert!(approx(dest.size.width, 2.0) && approx(dest.size.height, 2.0));
    }

    #[test]
    fn tile_projection_flips_content_into_clip_space() {
        let (_, program) = set_up(&RendererOptions::default());
        let data = DrawQuadData::new(DrawQuadType::Base, None,
                                     Rect::new(Point2D::new(400.0, 0.0), Size2D::new(400.0, 300.0)),
                                     1.0);
        let dest = program.tile_projection_matrix(&data).map_axis_aligned_rect(&unit_rect());
        // The top right quarter of the page is the top right of clip space.
        assert!(approx(dest.origin.x, 0.0) && approx(dest.origin.y, 0.0));
        assert!(approx(dest.size.width, 1.0) && approx(dest.size.height, 1.0));
    }

    #[test]
    fn inverted_colors_use_luminance_and_contrast() {
        let mut options = RendererOptions::default();
        options.inverted_screen = true;
        options.inverted_screen_contrast = 2.0;
        let device = RecordingDevice::new();
        let program = ShaderProgram::new(&options, &device.limits);
        let white = program.shader_color(&Color::new(1.0, 1.0, 1.0, 1.0), 1.0);
        // White has no intensity left, pushed away from the mid point by the
        // contrast.
        assert!(approx(white.r, -0.5));
        assert_eq!(white.r, white.g);
        assert_eq!(white.a, 1.0);

        let plain = ShaderProgram::new(&RendererOptions::default(), &device.limits);
        let half = plain.shader_color(&Color::new(1.0, 0.5, 0.0, 1.0), 0.5);
        assert_eq!(half, Color::new(0.5, 0.25, 0.0, 0.5));
    }

    #[test]
    fn axis_aligned_texture_quads_wait_for_the_flush() {
        let (mut device, mut program) = set_up(&RendererOptions::default());
        let count = Rc::new(Cell::new(0));
        let data = tile_quad(TextureId(900), ContentFlags::CAN_DEFER_RENDERING, None);
        program.draw_texture_quad(&mut device, &data, counting_callback(&count));

        assert!(device.draws.is_empty());
        assert_eq!(count.get(), 0);
        assert_eq!(program.pending_quad_count(), 1);

        program.flush_drawing(&mut device);
        assert_eq!(device.draws.len(), 1);
        assert_eq!(count.get(), 1);
        assert_eq!(program.pending_quad_count(), 0);
        assert!(device.draws[0].textures.contains(&(0, TextureId(900))));
    }

    #[test]
    fn rotated_quads_draw_immediately() {
        let (mut device, mut program) = set_up(&RendererOptions::default());
        let count = Rc::new(Cell::new(0));
        let rotation = Transform3D::create_rotation(0.0, 0.0, 1.0, euclid::Angle::radians(0.3));
        let data = tile_quad(TextureId(901), ContentFlags::CAN_DEFER_RENDERING, Some(rotation));
        program.draw_texture_quad(&mut device, &data, counting_callback(&count));

        assert_eq!(count.get(), 1);
        assert_eq!(device.draws.len(), 1);
        let draw = &device.draws[0];
        assert_eq!(draw.primitive, Primitive::TriangleStrip);
        assert_eq!(device.program_for_draw(draw).name, "tex_2d");
        assert_eq!(draw.uniforms["alpha"].float(), 1.0);
        assert_eq!(draw.uniforms["fillPortion"].vec4(), [0.0, 0.0, 1.0, 1.0]);
        // Textures have alpha unless flagged otherwise.
        assert!(draw.blend_enabled);
    }

    #[test]
    fn quads_without_the_defer_flag_draw_immediately() {
        let (mut device, mut program) = set_up(&RendererOptions::default());
        let data = tile_quad(TextureId(902), ContentFlags::HAS_NO_ALPHA, None);
        program.draw_texture_quad(&mut device, &data, None);
        assert_eq!(device.draws.len(), 1);
        assert!(!device.draws[0].blend_enabled);
    }

    #[test]
    fn inverted_screens_never_defer() {
        let mut options = RendererOptions::default();
        options.inverted_screen = true;
        let (mut device, mut program) = set_up(&options);
        let data = tile_quad(TextureId(903), ContentFlags::CAN_DEFER_RENDERING, None);
        program.draw_texture_quad(&mut device, &data, None);
        assert_eq!(device.draws.len(), 1);
        let draw = &device.draws[0];
        assert_eq!(device.program_for_draw(draw).name, "tex_2d_inverted");
        assert_eq!(draw.uniforms["contrast"], UniformValue::Float(1.0));
    }

    #[test]
    fn offscreen_quads_release_their_texture_right_away() {
        let (mut device, mut program) = set_up(&RendererOptions::default());
        let count = Rc::new(Cell::new(0));
        let mut data = tile_quad(TextureId(904), ContentFlags::CAN_DEFER_RENDERING, None);
        data.quad.geometry.origin = Point2D::new(5000.0, 5000.0);
        program.draw_texture_quad(&mut device, &data, counting_callback(&count));
        assert_eq!(count.get(), 1);
        assert_eq!(program.pending_quad_count(), 0);
        assert!(device.draws.is_empty());
    }

    #[test]
    fn transparent_color_quads_are_skipped() {
        let (mut device, mut program) = set_up(&RendererOptions::default());
        let quad = DrawQuadData::new(DrawQuadType::Base, None,
                                     Rect::new(Point2D::zero(), Size2D::new(100.0, 100.0)), 1.0);
        program.draw_color_quad(&mut device, &PureColorQuadData::new(quad, Color::transparent()));
        assert_eq!(program.pending_quad_count(), 0);

        let red = Color::new(1.0, 0.0, 0.0, 1.0);
        program.draw_color_quad(&mut device, &PureColorQuadData::new(quad, red));
        assert_eq!(program.pending_quad_count(), 1);
    }

    #[test]
    fn immediate_draws_flush_pending_quads_first() {
        let (mut device, mut program) = set_up(&RendererOptions::default());
        program.clear(&mut device, [1.0, 1.0, 1.0, 1.0]);
        assert_eq!(program.pending_quad_count(), 1);

        let skew = Transform3D::row_major(1.0, 0.2, 0.0, 0.0,
                                          0.0, 1.0, 0.0, 0.0,
                                          0.0, 0.0, 1.0, 0.0,
                                          0.0, 0.0, 0.0, 1.0);
        let quad = DrawQuadData::new(DrawQuadType::Layer, Some(skew),
                                     Rect::new(Point2D::zero(), Size2D::new(100.0, 100.0)), 1.0);
        program.draw_color_quad(&mut device,
                                &PureColorQuadData::new(quad, Color::new(0.0, 0.0, 1.0, 1.0)));
        assert_eq!(device.draws.len(), 2);
        assert_eq!(device.program_for_draw(&device.draws[1]).name, "pure_color");
        assert_eq!(device.draws[1].uniforms["inputColor"].vec4(), [0.0, 0.0, 1.0, 1.0]);
        assert_eq!(device.state_depth(), 0);
    }

    #[test]
    fn point_sampling_needs_a_one_to_one_mapping() {
        let (mut device, mut program) = set_up(&RendererOptions::default());
        assert!(program.use_point_sampling(1.0, None));
        assert!(!program.use_point_sampling(2.0, None));

        program.set_up_drawing(&mut device, screen(), to_float_rect(&screen()), screen(), 0,
                               screen(), 2.0);
        assert!(program.use_point_sampling(2.0, None));
        let half = Transform3D::create_scale(0.5, 0.5, 1.0);
        assert!(program.use_point_sampling(1.0, Some(&half)));
    }

    #[test]
    fn viewport_follows_the_screen_clip() {
        let (mut device, mut program) = set_up(&RendererOptions::default());
        let clip = Rect::new(Point2D::new(0, 100), Size2D::new(800, 400));
        program.set_up_drawing(&mut device, screen(), to_float_rect(&screen()), screen(), 0, clip,
                               1.0);
        // GL's origin is the bottom left corner of the target.
        assert_eq!(device.viewport(), Some(Rect::new(Point2D::new(0, 100), Size2D::new(800, 400))));
    }

    #[test]
    fn clipping_sets_the_scissor_and_narrows_the_drawable_area() {
        let (mut device, mut program) = set_up(&RendererOptions::default());
        assert_eq!(program.viewport_clip_rect(),
                   Some(Rect::new(Point2D::new(-1.0, -1.0), Size2D::new(2.0, 2.0))));

        program.clip(&mut device, &Rect::new(Point2D::new(0.0, 0.0), Size2D::new(400.0, 600.0)));
        let clip = program.viewport_clip_rect().unwrap();
        assert!(approx(clip.origin.x, -1.0) && approx(clip.size.width, 1.0));
        assert!(approx(clip.size.height, 2.0));

        // A quad entirely in the scissored half never reaches the batch.
        let count = Rc::new(Cell::new(0));
        let mut data = tile_quad(TextureId(905), ContentFlags::CAN_DEFER_RENDERING, None);
        data.quad.geometry.origin = Point2D::new(500.0, 0.0);
        program.draw_texture_quad(&mut device, &data, counting_callback(&count));
        assert_eq!(count.get(), 1);
        assert_eq!(program.pending_quad_count(), 0);
    }

    #[test]
    fn view_coordinates_round_trip() {
        let (_, program) = set_up(&RendererOptions::default());
        let rect = Rect::new(Point2D::new(10.0, 20.0), Size2D::new(30.0, 40.0));
        let view = program.rect_in_view_coord(&rect);
        let inv_view = program.convert_view_coord_to_inv_view_coord(&view);
        let back = program.convert_inv_view_coord_to_content_coord(&inv_view);
        assert!(approx(back.origin.x, 10.0) && approx(back.origin.y, 20.0));
        assert!(approx(back.size.width, 30.0) && approx(back.size.height, 40.0));
        // Inverted view coordinates put the origin at the bottom.
        assert!(approx(inv_view.origin.y, 600.0 - 60.0));
    }

    #[test]
    fn video_quads_draw_unblended_with_the_external_sampler() {
        let (mut device, mut program) = set_up(&RendererOptions::default());
        program.draw_video_layer_quad(&mut device,
                                      &Transform3D::identity(),
                                      &Transform3D::identity(),
                                      &Rect::new(Point2D::zero(), Size2D::new(320.0, 240.0)),
                                      TextureId(77));
        assert_eq!(device.draws.len(), 1);
        let draw = &device.draws[0];
        assert_eq!(device.program_for_draw(draw).name, "video");
        assert!(!draw.blend_enabled);
        assert!(draw.textures.contains(&(0, TextureId(77))));
    }

    #[test]
    fn mirrored_quads_generate_mirrored_texture_coordinates() {
        let flip = Transform3D::create_scale(1.0, -1.0, 1.0);
        let dest = Rect::new(Point2D::new(-1.0, -1.0), Size2D::new(2.0, 2.0));
        let texgen = texture_generation_rect(&flip, &dest, &unit_rect());
        // The top of the quad samples v = 0.
        assert!(approx(texgen.origin.y + 1.0 * texgen.size.height, 0.0));
        assert!(approx(texgen.origin.y - 1.0 * texgen.size.height, 1.0));
        assert!(approx(texgen.origin.x + -1.0 * texgen.size.width, 0.0));
    }
}
