/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! A `Device` that records what would have been sent to GL.

use crate::device::{BlendFactor, Device, DeviceLimits, DrawTextureRect, Primitive, ProgramId};
use crate::device::{ResetStatus, ShaderError, TextureFilter, TextureId, TextureTarget};
use crate::device::{UniformLocation, VboId};
use crate::util::{IntRect, Matrix};
use fxhash::FxHashMap;

/// Routes `log` output to stderr for the test run. `RUST_LOG` picks the
/// level; repeated calls are harmless.
pub fn init_test_logging() {
    let _ = env_logger::try_init();
}

#[derive(Clone, Debug, PartialEq)]
pub enum UniformValue {
    Int(i32),
    Float(f32),
    Vec2([f32; 2]),
    Vec4([f32; 4]),
    Mat4(Matrix),
}

impl UniformValue {
    pub fn vec4(&self) -> [f32; 4] {
        match *self {
            UniformValue::Vec4(v) => v,
            ref other => panic!("not a vec4: {:?}", other),
        }
    }

    pub fn float(&self) -> f32 {
        match *self {
            UniformValue::Float(v) => v,
            ref other => panic!("not a float: {:?}", other),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RecordedProgram {
    pub name: String,
    pub vertex_source: String,
    pub fragment_source: String,
    pub attributes: Vec<(u32, String)>,
    pub values: FxHashMap<String, UniformValue>,
}

#[derive(Clone, Debug)]
pub struct DrawCall {
    pub program: Option<ProgramId>,
    pub primitive: Primitive,
    pub count: i32,
    pub uniforms: FxHashMap<String, UniformValue>,
    pub blend_enabled: bool,
    pub blend_func: (BlendFactor, BlendFactor),
    pub textures: Vec<(u32, TextureId)>,
    pub fast_path: Option<(TextureId, DrawTextureRect)>,
}

#[derive(Clone, Debug, PartialEq)]
struct RecordedState {
    program: Option<ProgramId>,
    blend_enabled: bool,
    blend_func: (BlendFactor, BlendFactor),
    scissor: Option<IntRect>,
    viewport: Option<IntRect>,
}

pub struct RecordingDevice {
    pub limits: DeviceLimits,
    pub draw_texture_supported: bool,
    pub programs: FxHashMap<ProgramId, RecordedProgram>,
    pub deleted_programs: Vec<ProgramId>,
    pub textures: FxHashMap<TextureId, (u32, u32)>,
    pub deleted_textures: Vec<TextureId>,
    pub vertex_buffers: Vec<VboId>,
    pub draws: Vec<DrawCall>,
    pub filters: Vec<(TextureTarget, TextureFilter)>,
    pub fail_compiles: bool,
    pub pending_reset: Option<ResetStatus>,
    locations: Vec<(ProgramId, String)>,
    bound_textures: FxHashMap<u32, TextureId>,
    state: RecordedState,
    saved: Vec<RecordedState>,
    next_id: u32,
}

impl RecordingDevice {
    pub fn new() -> RecordingDevice {
        init_test_logging();
        RecordingDevice {
            limits: DeviceLimits {
                max_texture_units: 16,
                max_varying_vectors: 8,
                max_vertex_uniform_vectors: 128,
                max_fragment_uniform_vectors: 16,
                max_texture_size: 4096,
            },
            draw_texture_supported: false,
            programs: FxHashMap::default(),
            deleted_programs: Vec::new(),
            textures: FxHashMap::default(),
            deleted_textures: Vec::new(),
            vertex_buffers: Vec::new(),
            draws: Vec::new(),
            filters: Vec::new(),
            fail_compiles: false,
            pending_reset: None,
            locations: Vec::new(),
            bound_textures: FxHashMap::default(),
            state: RecordedState {
                program: None,
                blend_enabled: false,
                blend_func: (BlendFactor::One, BlendFactor::Zero),
                scissor: None,
                viewport: None,
            },
            saved: Vec::new(),
            next_id: 1,
        }
    }

    pub fn viewport(&self) -> Option<IntRect> {
        self.state.viewport
    }

    pub fn blend_enabled(&self) -> bool {
        self.state.blend_enabled
    }

    pub fn state_depth(&self) -> usize {
        self.saved.len()
    }

    pub fn program_for_draw(&self, draw: &DrawCall) -> &RecordedProgram {
        let id = draw.program.expect("draw without a program");
        &self.programs[&id]
    }

    fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn set_uniform(&mut self, location: UniformLocation, value: UniformValue) {
        if location.0 < 0 {
            return;
        }
        let (program, name) = self.locations[location.0 as usize].clone();
        assert_eq!(Some(program), self.state.program, "uniform {} set on unbound program", name);
        if let Some(program) = self.programs.get_mut(&program) {
            program.values.insert(name, value);
        }
    }

    fn record_draw(&mut self, primitive: Primitive, count: i32,
                   fast_path: Option<(TextureId, DrawTextureRect)>) {
        let uniforms = match self.state.program.and_then(|p| self.programs.get(&p)) {
            Some(program) if fast_path.is_none() => program.values.clone(),
            _ => FxHashMap::default(),
        };
        let mut textures: Vec<(u32, TextureId)> =
            self.bound_textures.iter().map(|(unit, id)| (*unit, *id)).collect();
        textures.sort();
        self.draws.push(DrawCall {
            program: if fast_path.is_some() { None } else { self.state.program },
            primitive,
            count,
            uniforms,
            blend_enabled: self.state.blend_enabled,
            blend_func: self.state.blend_func,
            textures,
            fast_path,
        });
    }
}

impl Device for RecordingDevice {
    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn reset_status(&mut self) -> ResetStatus {
        self.pending_reset.take().unwrap_or(ResetStatus::NoError)
    }

    fn create_texture(&mut self) -> TextureId {
        let id = TextureId(self.alloc_id());
        self.textures.insert(id, (0, 0));
        id
    }

    fn upload_texture(&mut self, _target: TextureTarget, id: TextureId,
                      width: u32, height: u32, pixels: &[u8]) {
        assert_eq!(pixels.len(), (width * height * 4) as usize);
        self.textures.insert(id, (width, height));
    }

    fn delete_texture(&mut self, id: TextureId) {
        if self.textures.remove(&id).is_some() {
            self.deleted_textures.push(id);
        }
    }

    fn bind_texture(&mut self, unit: u32, _target: TextureTarget, id: TextureId) {
        self.bound_textures.insert(unit, id);
    }

    fn set_texture_filter(&mut self, target: TextureTarget, filter: TextureFilter) {
        self.filters.push((target, filter));
    }

    fn create_program(&mut self,
                      name: &str,
                      vertex_source: &str,
                      fragment_source: &str,
                      attributes: &[(u32, &str)])
                      -> Result<ProgramId, ShaderError> {
        if self.fail_compiles {
            return Err(ShaderError::Compilation(name.to_owned(), "rejected".to_owned()));
        }
        let id = ProgramId(self.alloc_id());
        self.programs.insert(id, RecordedProgram {
            name: name.to_owned(),
            vertex_source: vertex_source.to_owned(),
            fragment_source: fragment_source.to_owned(),
            attributes: attributes.iter().map(|&(i, a)| (i, a.to_owned())).collect(),
            values: FxHashMap::default(),
        });
        Ok(id)
    }

    fn delete_program(&mut self, id: ProgramId) {
        if self.programs.remove(&id).is_some() {
            self.deleted_programs.push(id);
        }
        if self.state.program == Some(id) {
            self.state.program = None;
        }
    }

    fn use_program(&mut self, id: ProgramId) {
        assert!(self.programs.contains_key(&id), "using a deleted program");
        self.state.program = Some(id);
    }

    fn uniform_location(&mut self, program: ProgramId, name: &str) -> UniformLocation {
        if let Some(index) = self.locations.iter().position(|l| l.0 == program && l.1 == name) {
            return UniformLocation(index as i32);
        }
        self.locations.push((program, name.to_owned()));
        UniformLocation(self.locations.len() as i32 - 1)
    }

    fn set_uniform_int(&mut self, location: UniformLocation, value: i32) {
        self.set_uniform(location, UniformValue::Int(value));
    }

    fn set_uniform_float(&mut self, location: UniformLocation, value: f32) {
        self.set_uniform(location, UniformValue::Float(value));
    }

    fn set_uniform_vec2(&mut self, location: UniformLocation, value: [f32; 2]) {
        self.set_uniform(location, UniformValue::Vec2(value));
    }

    fn set_uniform_vec4(&mut self, location: UniformLocation, value: [f32; 4]) {
        self.set_uniform(location, UniformValue::Vec4(value));
    }

    fn set_uniform_mat4(&mut self, location: UniformLocation, value: &Matrix) {
        self.set_uniform(location, UniformValue::Mat4(*value));
    }

    fn create_vertex_buffer(&mut self, _data: &[f32]) -> VboId {
        let id = VboId(self.alloc_id());
        self.vertex_buffers.push(id);
        id
    }

    fn delete_vertex_buffer(&mut self, id: VboId) {
        self.vertex_buffers.retain(|v| *v != id);
    }

    fn bind_vertex_buffer(&mut self, id: VboId, _attribute: u32, _components: i32) {
        assert!(self.vertex_buffers.contains(&id), "binding a deleted vertex buffer");
    }

    fn set_blend_enabled(&mut self, enabled: bool) {
        self.state.blend_enabled = enabled;
    }

    fn set_blend_func(&mut self, src: BlendFactor, dst: BlendFactor) {
        self.state.blend_func = (src, dst);
    }

    fn set_blend_equation_add(&mut self) {}

    fn set_scissor(&mut self, rect: Option<IntRect>) {
        self.state.scissor = rect;
    }

    fn set_viewport(&mut self, rect: IntRect) {
        self.state.viewport = Some(rect);
    }

    fn draw_arrays(&mut self, primitive: Primitive, _first: i32, count: i32) {
        self.record_draw(primitive, count, None);
    }

    fn supports_draw_texture(&self) -> bool {
        self.draw_texture_supported
    }

    fn draw_texture(&mut self, texture: TextureId, rect: &DrawTextureRect) {
        self.record_draw(Primitive::TriangleStrip, 4, Some((texture, *rect)));
    }

    fn save_state(&mut self) {
        self.saved.push(self.state.clone());
    }

    fn restore_state(&mut self) {
        if let Some(state) = self.saved.pop() {
            self.state = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logging_setup_is_idempotent() {
        init_test_logging();
        init_test_logging();
        debug!("test logging is set up");
        assert!(RecordingDevice::new().draws.is_empty());
    }
}
