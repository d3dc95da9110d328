/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The narrow slice of GL the compositor talks to.
//!
//! Everything that draws goes through the `Device` trait so that the
//! batching logic can run against a recording device in tests. `GlDevice`
//! is the real implementation on top of gleam.

use euclid::{Point2D, Size2D};
use gleam::gl;
use crate::util::{IntRect, Matrix, MatrixHelpers};
use std::error::Error;
use std::fmt;
use std::rc::Rc;

const TEXTURE_EXTERNAL_OES: gl::GLenum = 0x8D65;
const GL_CONTEXT_LOST: gl::GLenum = 0x0507;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TextureId(pub gl::GLuint);

impl TextureId {
    pub fn invalid() -> TextureId {
        TextureId(0)
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ProgramId(pub gl::GLuint);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct VboId(pub gl::GLuint);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct UniformLocation(pub gl::GLint);

impl UniformLocation {
    pub fn invalid() -> UniformLocation {
        UniformLocation(-1)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TextureTarget {
    Default,
    External,
}

impl TextureTarget {
    fn to_gl_target(&self) -> gl::GLenum {
        match *self {
            TextureTarget::Default => gl::TEXTURE_2D,
            TextureTarget::External => TEXTURE_EXTERNAL_OES,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TextureFilter {
    Nearest,
    Linear,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BlendFactor {
    Zero,
    One,
    SrcAlpha,
    OneMinusSrcAlpha,
}

impl BlendFactor {
    fn to_gl(&self) -> gl::GLenum {
        match *self {
            BlendFactor::Zero => gl::ZERO,
            BlendFactor::One => gl::ONE,
            BlendFactor::SrcAlpha => gl::SRC_ALPHA,
            BlendFactor::OneMinusSrcAlpha => gl::ONE_MINUS_SRC_ALPHA,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Primitive {
    TriangleFan,
    TriangleStrip,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResetStatus {
    NoError,
    Guilty,
    Innocent,
    Unknown,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DeviceLimits {
    pub max_texture_units: u32,
    pub max_varying_vectors: u32,
    pub max_vertex_uniform_vectors: u32,
    pub max_fragment_uniform_vectors: u32,
    pub max_texture_size: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShaderError {
    Compilation(String, String),
    Link(String, String),
}

impl fmt::Display for ShaderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ShaderError::Compilation(ref name, ref log) => {
                write!(f, "failed to compile shader {}: {}", name, log)
            }
            ShaderError::Link(ref name, ref log) => {
                write!(f, "failed to link shader program {}: {}", name, log)
            }
        }
    }
}

impl Error for ShaderError {}

/// Window-space rectangle for the texture fast path, as (x0, y0, x1, y1).
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct DrawTextureRect {
    pub dst: [f32; 4],
    pub src: [f32; 4],
}

pub trait Device {
    fn limits(&self) -> DeviceLimits;

    /// Queries and clears the context reset status.
    fn reset_status(&mut self) -> ResetStatus;

    fn create_texture(&mut self) -> TextureId;
    fn upload_texture(&mut self, target: TextureTarget, id: TextureId,
                      width: u32, height: u32, pixels: &[u8]);
    fn delete_texture(&mut self, id: TextureId);
    fn bind_texture(&mut self, unit: u32, target: TextureTarget, id: TextureId);
    /// Applies to the texture bound on the active unit.
    fn set_texture_filter(&mut self, target: TextureTarget, filter: TextureFilter);

    fn create_program(&mut self,
                      name: &str,
                      vertex_source: &str,
                      fragment_source: &str,
                      attributes: &[(u32, &str)])
                      -> Result<ProgramId, ShaderError>;
    fn delete_program(&mut self, id: ProgramId);
    fn use_program(&mut self, id: ProgramId);
    fn uniform_location(&mut self, program: ProgramId, name: &str) -> UniformLocation;
    fn set_uniform_int(&mut self, location: UniformLocation, value: i32);
    fn set_uniform_float(&mut self, location: UniformLocation, value: f32);
    fn set_uniform_vec2(&mut self, location: UniformLocation, value: [f32; 2]);
    fn set_uniform_vec4(&mut self, location: UniformLocation, value: [f32; 4]);
    fn set_uniform_mat4(&mut self, location: UniformLocation, value: &Matrix);

    fn create_vertex_buffer(&mut self, data: &[f32]) -> VboId;
    fn delete_vertex_buffer(&mut self, id: VboId);
    /// Binds the buffer and points `attribute` at it with `components` floats
    /// per vertex.
    fn bind_vertex_buffer(&mut self, id: VboId, attribute: u32, components: i32);

    fn set_blend_enabled(&mut self, enabled: bool);
    fn set_blend_func(&mut self, src: BlendFactor, dst: BlendFactor);
    fn set_blend_equation_add(&mut self);
    fn set_scissor(&mut self, rect: Option<IntRect>);
    fn set_viewport(&mut self, rect: IntRect);

    fn draw_arrays(&mut self, primitive: Primitive, first: i32, count: i32);

    fn supports_draw_texture(&self) -> bool {
        false
    }

    fn draw_texture(&mut self, _texture: TextureId, _rect: &DrawTextureRect) {}

    fn save_state(&mut self);
    fn restore_state(&mut self);
}

#[derive(Clone, Debug, PartialEq)]
struct GlState {
    program: Option<ProgramId>,
    blend_enabled: bool,
    blend_func: (BlendFactor, BlendFactor),
    scissor: Option<IntRect>,
    viewport: IntRect,
    active_unit: u32,
}

impl Default for GlState {
    fn default() -> GlState {
        GlState {
            program: None,
            blend_enabled: false,
            blend_func: (BlendFactor::One, BlendFactor::Zero),
            scissor: None,
            viewport: IntRect::new(Point2D::zero(), Size2D::zero()),
            active_unit: 0,
        }
    }
}

pub struct GlDevice {
    gl: Rc<dyn gl::Gl>,
    limits: DeviceLimits,
    state: GlState,
    saved: Vec<GlState>,
}

impl GlDevice {
    pub fn new(gl: Rc<dyn gl::Gl>) -> GlDevice {
        let limits = DeviceLimits {
            max_texture_units: { let mut v = [0]; unsafe { gl.get_integer_v(gl::MAX_TEXTURE_IMAGE_UNITS, &mut v) }; v[0] }.max(0) as u32,
            max_varying_vectors: { let mut v = [0]; unsafe { gl.get_integer_v(gl::MAX_VARYING_VECTORS, &mut v) }; v[0] }.max(0) as u32,
            max_vertex_uniform_vectors: { let mut v = [0]; unsafe { gl.get_integer_v(gl::MAX_VERTEX_UNIFORM_VECTORS, &mut v) }; v[0] }.max(0) as u32,
            max_fragment_uniform_vectors: { let mut v = [0]; unsafe { gl.get_integer_v(gl::MAX_FRAGMENT_UNIFORM_VECTORS, &mut v) }; v[0] }.max(0) as u32,
            max_texture_size: { let mut v = [0]; unsafe { gl.get_integer_v(gl::MAX_TEXTURE_SIZE, &mut v) }; v[0] }.max(0) as u32,
        };
        debug!("GL limits {:?}", limits);

        GlDevice {
            gl,
            limits,
            state: GlState::default(),
            saved: Vec::new(),
        }
    }

    pub fn gl(&self) -> &dyn gl::Gl {
        &*self.gl
    }

    fn compile_shader(&self, name: &str, shader_type: gl::GLenum, source: &str)
                      -> Result<gl::GLuint, ShaderError> {
        let id = self.gl.create_shader(shader_type);
        self.gl.shader_source(id, &[source.as_bytes()]);
        self.gl.compile_shader(id);
        if { let mut v = [0]; unsafe { self.gl.get_shader_iv(id, gl::COMPILE_STATUS, &mut v) }; v[0] } == (0 as gl::GLint) {
            let log = self.gl.get_shader_info_log(id);
            self.gl.delete_shader(id);
            return Err(ShaderError::Compilation(name.to_owned(), log));
        }
        Ok(id)
    }

    fn apply_state(&mut self, state: GlState) {
        match state.program {
            Some(ProgramId(id)) => self.gl.use_program(id),
            None => self.gl.use_program(0),
        }
        self.set_blend_enabled(state.blend_enabled);
        self.set_blend_func(state.blend_func.0, state.blend_func.1);
        self.set_scissor(state.scissor);
        self.set_viewport(state.viewport);
        self.gl.active_texture(gl::TEXTURE0 + state.active_unit);
        self.state = state;
    }
}

impl Device for GlDevice {
    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn reset_status(&mut self) -> ResetStatus {
        if self.gl.get_error() == GL_CONTEXT_LOST {
            warn!("GL context lost");
            ResetStatus::Unknown
        } else {
            ResetStatus::NoError
        }
    }

    fn create_texture(&mut self) -> TextureId {
        match self.gl.gen_textures(1).first() {
            Some(&id) => TextureId(id),
            None => TextureId::invalid(),
        }
    }

    fn upload_texture(&mut self, target: TextureTarget, id: TextureId,
                      width: u32, height: u32, pixels: &[u8]) {
        let gl_target = target.to_gl_target();
        self.gl.bind_texture(gl_target, id.0);
        self.gl.tex_image_2d(gl_target,
                             0,
                             gl::RGBA as gl::GLint,
                             width as gl::GLint,
                             height as gl::GLint,
                             0,
                             gl::RGBA,
                             gl::UNSIGNED_BYTE,
                             Some(pixels));
        self.gl.tex_parameter_i(gl_target, gl::TEXTURE_WRAP_S, gl::CLAMP_TO_EDGE as gl::GLint);
        self.gl.tex_parameter_i(gl_target, gl::TEXTURE_WRAP_T, gl::CLAMP_TO_EDGE as gl::GLint);
    }

    fn delete_texture(&mut self, id: TextureId) {
        if id.is_valid() {
            self.gl.delete_textures(&[id.0]);
        }
    }

    fn bind_texture(&mut self, unit: u32, target: TextureTarget, id: TextureId) {
        if self.state.active_unit != unit {
            self.gl.active_texture(gl::TEXTURE0 + unit);
            self.state.active_unit = unit;
        }
        self.gl.bind_texture(target.to_gl_target(), id.0);
    }

    fn set_texture_filter(&mut self, target: TextureTarget, filter: TextureFilter) {
        let filter = match filter {
            TextureFilter::Nearest => gl::NEAREST,
            TextureFilter::Linear => gl::LINEAR,
        };
        let gl_target = target.to_gl_target();
        self.gl.tex_parameter_i(gl_target, gl::TEXTURE_MIN_FILTER, filter as gl::GLint);
        self.gl.tex_parameter_i(gl_target, gl::TEXTURE_MAG_FILTER, filter as gl::GLint);
    }

    fn create_program(&mut self,
                      name: &str,
                      vertex_source: &str,
                      fragment_source: &str,
                      attributes: &[(u32, &str)])
                      -> Result<ProgramId, ShaderError> {
        let vs_id = self.compile_shader(name, gl::VERTEX_SHADER, vertex_source)?;
        let fs_id = match self.compile_shader(name, gl::FRAGMENT_SHADER, fragment_source) {
            Ok(fs_id) => fs_id,
            Err(e) => {
                self.gl.delete_shader(vs_id);
                return Err(e);
            }
        };

        let pid = self.gl.create_program();
        self.gl.attach_shader(pid, vs_id);
        self.gl.attach_shader(pid, fs_id);
        for &(index, attribute) in attributes {
            self.gl.bind_attrib_location(pid, index, attribute);
        }
        self.gl.link_program(pid);

        self.gl.delete_shader(vs_id);
        self.gl.delete_shader(fs_id);

        if { let mut v = [0]; unsafe { self.gl.get_program_iv(pid, gl::LINK_STATUS, &mut v) }; v[0] } == (0 as gl::GLint) {
            let log = self.gl.get_program_info_log(pid);
            self.gl.delete_program(pid);
            return Err(ShaderError::Link(name.to_owned(), log));
        }

        Ok(ProgramId(pid))
    }

    fn delete_program(&mut self, id: ProgramId) {
        if self.state.program == Some(id) {
            self.state.program = None;
        }
        self.gl.delete_program(id.0);
    }

    fn use_program(&mut self, id: ProgramId) {
        if self.state.program != Some(id) {
            self.gl.use_program(id.0);
            self.state.program = Some(id);
        }
    }

    fn uniform_location(&mut self, program: ProgramId, name: &str) -> UniformLocation {
        UniformLocation(self.gl.get_uniform_location(program.0, name))
    }

    fn set_uniform_int(&mut self, location: UniformLocation, value: i32) {
        self.gl.uniform_1i(location.0, value);
    }

    fn set_uniform_float(&mut self, location: UniformLocation, value: f32) {
        self.gl.uniform_1f(location.0, value);
    }

    fn set_uniform_vec2(&mut self, location: UniformLocation, value: [f32; 2]) {
        self.gl.uniform_2f(location.0, value[0], value[1]);
    }

    fn set_uniform_vec4(&mut self, location: UniformLocation, value: [f32; 4]) {
        self.gl.uniform_4f(location.0, value[0], value[1], value[2], value[3]);
    }

    fn set_uniform_mat4(&mut self, location: UniformLocation, value: &Matrix) {
        self.gl.uniform_matrix_4fv(location.0, false, &value.to_gl_array());
    }

    fn create_vertex_buffer(&mut self, data: &[f32]) -> VboId {
        let id = match self.gl.gen_buffers(1).first() {
            Some(&id) => id,
            None => return VboId(0),
        };
        self.gl.bind_buffer(gl::ARRAY_BUFFER, id);
        gl::buffer_data(&*self.gl, gl::ARRAY_BUFFER, data, gl::STATIC_DRAW);
        VboId(id)
    }

    fn delete_vertex_buffer(&mut self, id: VboId) {
        if id.0 != 0 {
            self.gl.delete_buffers(&[id.0]);
        }
    }

    fn bind_vertex_buffer(&mut self, id: VboId, attribute: u32, components: i32) {
        self.gl.bind_buffer(gl::ARRAY_BUFFER, id.0);
        self.gl.enable_vertex_attrib_array(attribute);
        self.gl.vertex_attrib_pointer(attribute, components, gl::FLOAT, false, 0, 0);
    }

    fn set_blend_enabled(&mut self, enabled: bool) {
        if enabled {
            self.gl.enable(gl::BLEND);
        } else {
            self.gl.disable(gl::BLEND);
        }
        self.state.blend_enabled = enabled;
    }

    fn set_blend_func(&mut self, src: BlendFactor, dst: BlendFactor) {
        self.gl.blend_func(src.to_gl(), dst.to_gl());
        self.state.blend_func = (src, dst);
    }

    fn set_blend_equation_add(&mut self) {
        self.gl.blend_equation(gl::FUNC_ADD);
    }

    fn set_scissor(&mut self, rect: Option<IntRect>) {
        match rect {
            Some(rect) => {
                self.gl.enable(gl::SCISSOR_TEST);
                self.gl.scissor(rect.origin.x, rect.origin.y, rect.size.width, rect.size.height);
            }
            None => self.gl.disable(gl::SCISSOR_TEST),
        }
        self.state.scissor = rect;
    }

    fn set_viewport(&mut self, rect: IntRect) {
        self.gl.viewport(rect.origin.x, rect.origin.y, rect.size.width, rect.size.height);
        self.state.viewport = rect;
    }

    fn draw_arrays(&mut self, primitive: Primitive, first: i32, count: i32) {
        let mode = match primitive {
            Primitive::TriangleFan => gl::TRIANGLE_FAN,
            Primitive::TriangleStrip => gl::TRIANGLE_STRIP,
        };
        self.gl.draw_arrays(mode, first, count);
    }

    fn save_state(&mut self) {
        self.saved.push(self.state.clone());
    }

    fn restore_state(&mut self) {
        if let Some(state) = self.saved.pop() {
            if state != self.state {
                self.apply_state(state);
            }
        }
    }
}
