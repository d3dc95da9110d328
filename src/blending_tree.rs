/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Deferred quad blending.
//!
//! Instead of drawing quads one by one, the tree divides the viewport into
//! rectangular subspaces, each with a stack of layers (a solid color or a
//! texture). Inserting a quad splits space along its four edges, recursing
//! into whichever existing subspaces it overlaps, and pushes the quad's layer
//! onto the stack of the subspace it covers. At draw time every subspace is
//! filled once, with a shader generated for exactly its layer stack.
//!
//! ```text
//!                      subspace 1
//!   <------------------------------------------------>
//!              |                  |
//!              |       quad       |
//!  subspace 4  |    subspace 5    |    subspace 2
//!              |                  |
//!   <---------------------------- |
//!              subspace 3         |
//!                                 v
//! ```

use crate::device::{BlendFactor, Device, DeviceLimits, DrawTextureRect, Primitive, ProgramId};
use crate::device::{TextureId, TextureTarget, UniformLocation, VboId};
use crate::lru_cache::LruCache;
use crate::util::{intersect_rects, FloatRect, IntRect};
use euclid::{Point2D, Rect, Size2D};
use smallvec::SmallVec;
use std::cmp;
use std::fmt::{self, Write};

const EPSILON: f32 = 1e-5;
pub const MAX_QUAD_COUNT: usize = 128;
const SHADER_CACHE_CAPACITY: usize = 128;

const LAYER_TYPE_MASK: u64 = 0b0011;
const COLOR_LAYER: u64 = 0b0001;
const TEXTURE_LAYER: u64 = 0b0010;
const HAS_OPACITY: u64 = 0b0100;
const NEEDS_MULTIPLY_ALPHA: u64 = 0b1000;

const UNIT_SQUARE: [f32; 8] = [0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0];

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferMode {
    /// Replaces whatever is underneath.
    StraightCopy,
    PremultipliedAlphaBlend,
    UnmultipliedAlphaBlend,
}

#[derive(Debug, Copy, Clone)]
struct BlendingLayer {
    /// Invalid for solid color layers.
    texture: TextureId,
    /// The color for color layers, (scale x, scale y, offset x, offset y)
    /// texgen for textured ones.
    params: [f32; 4],
    opacity: f32,
    transfer_mode: TransferMode,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct NodeIndex(usize);

/// Index 0 is the shared leaf that draws the layer stack accumulated on the
/// way down.
const DRAW_QUAD_NODE: NodeIndex = NodeIndex(0);

#[derive(Debug, Copy, Clone)]
enum BlendingNode {
    DrawQuad,
    HorizontalSplit { split_x: f32, left: NodeIndex, right: NodeIndex },
    VerticalSplit { split_y: f32, top: NodeIndex, bottom: NodeIndex },
    PushLayer { child: NodeIndex, layer: usize },
}

bitflags! {
    /// Edges of a quad that coincide with an existing split, and so need no
    /// new split node of their own.
    struct Edges: u32 {
        const RIGHT = 1 << 0;
        const TOP = 1 << 1;
        const LEFT = 1 << 2;
        const BOTTOM = 1 << 3;
    }
}

/// A link in the per-leaf layer stack, built on the call stack while drawing.
struct LayerLink<'a> {
    previous: Option<&'a LayerLink<'a>>,
    shader_key: u64,
    layer: &'a BlendingLayer,
}

type Locations = SmallVec<[UniformLocation; 4]>;

struct BlendingShader {
    key: u64,
    program: ProgramId,
    color_count: usize,
    texture_count: usize,
    opacity_count: usize,
    position: UniformLocation,
    colors: Locations,
    texgens: Locations,
    opacities: Locations,
}

/// Counts of (layers, colors, textures, opacities) encoded in a shader key.
fn key_counts(key: u64) -> (usize, usize, usize, usize) {
    let (mut layers, mut colors, mut textures, mut opacities) = (0, 0, 0, 0);
    let mut key = key;
    while key != 0 {
        if key & LAYER_TYPE_MASK == COLOR_LAYER {
            colors += 1;
        } else {
            textures += 1;
        }
        if key & HAS_OPACITY != 0 {
            opacities += 1;
        }
        layers += 1;
        key >>= 4;
    }
    (layers, colors, textures, opacities)
}

fn texcoord_swizzle(index: usize) -> &'static str {
    if index & 1 != 0 { "zw" } else { "xy" }
}

/// Generates the (vertex, fragment) sources blending the layers of `key`,
/// oldest layer in the most significant nibble.
pub fn blending_shader_sources(key: u64) -> Result<(String, String), fmt::Error> {
    let mut vs = String::new();
    write_vertex_shader(&mut vs, key)?;
    let mut fs = String::new();
    write_fragment_shader(&mut fs, key)?;
    Ok((vs, fs))
}

fn write_vertex_shader(vs: &mut String, key: u64) -> fmt::Result {
    let (_, _, texture_count, _) = key_counts(key);
    let varying_count = (1 + texture_count) / 2;

    writeln!(vs, "uniform vec4 position;")?;
    writeln!(vs, "attribute vec2 corner;")?;
    if texture_count > 0 {
        writeln!(vs, "uniform vec4 texgen[{}];", texture_count)?;
        writeln!(vs, "varying vec4 texcoords[{}];", varying_count)?;
    }
    writeln!(vs, "void main()")?;
    writeln!(vs, "{{")?;
    writeln!(vs, "vec4 vertex = vec4(corner * position.xy + position.zw, 0, 1);")?;
    for i in 0 .. texture_count {
        writeln!(vs, "texcoords[{}].{} = vertex.xy * texgen[{}].xy + texgen[{}].zw;",
                 i / 2, texcoord_swizzle(i), i, i)?;
    }
    writeln!(vs, "gl_Position = vertex;")?;
    writeln!(vs, "}}")
}

fn write_fragment_shader(fs: &mut String, key: u64) -> fmt::Result {
    let (layer_count, color_count, texture_count, opacity_count) = key_counts(key);
    let varying_count = (1 + texture_count) / 2;

    writeln!(fs, "precision lowp float;")?;
    if color_count > 0 {
        writeln!(fs, "uniform vec4 colors[{}];", color_count)?;
    }
    if texture_count > 0 {
        writeln!(fs, "uniform sampler2D textures[{}];", texture_count)?;
        writeln!(fs, "varying vec4 texcoords[{}];", varying_count)?;
    }
    if opacity_count > 0 {
        writeln!(fs, "uniform float opacities[{}];", opacity_count)?;
    }
    if layer_count > 1 {
        writeln!(fs, "vec4 blend(vec4 color1, vec4 color2)")?;
        writeln!(fs, "{{")?;
        writeln!(fs, "return (1.0 - color2.a) * color1 + color2;")?;
        writeln!(fs, "}}")?;
    }
    writeln!(fs, "void main()")?;
    writeln!(fs, "{{")?;
    writeln!(fs, "vec4 layerColor, accumulatedColor;")?;
    let (mut texture_index, mut color_index, mut opacity_index) = (0, 0, 0);
    for i in 0 .. layer_count {
        let layer_key = (key >> (4 * (layer_count - i - 1))) & 0xf;
        if layer_key & LAYER_TYPE_MASK == COLOR_LAYER {
            writeln!(fs, "layerColor = colors[{}];", color_index)?;
            color_index += 1;
        } else {
            writeln!(fs, "layerColor = texture2D(textures[{}], texcoords[{}].{});",
                     texture_index, texture_index / 2, texcoord_swizzle(texture_index))?;
            texture_index += 1;
        }
        if layer_key & NEEDS_MULTIPLY_ALPHA != 0 {
            writeln!(fs, "layerColor = vec4(layerColor.a * layerColor.rgb, layerColor.a);")?;
        }
        if layer_key & HAS_OPACITY != 0 {
            writeln!(fs, "layerColor = opacities[{}] * layerColor;", opacity_index)?;
            opacity_index += 1;
        }
        if i == 0 {
            writeln!(fs, "accumulatedColor = layerColor;")?;
        } else {
            writeln!(fs, "accumulatedColor = blend(accumulatedColor, layerColor);")?;
        }
    }
    writeln!(fs, "gl_FragColor = accumulatedColor;")?;
    writeln!(fs, "}}")
}

fn array_locations(device: &mut dyn Device, program: ProgramId, name: &str, count: usize)
                   -> Locations {
    (0 .. count)
        .map(|i| device.uniform_location(program, &format!("{}[{}]", name, i)))
        .collect()
}

impl BlendingShader {
    fn new(device: &mut dyn Device, key: u64) -> Option<BlendingShader> {
        debug_assert!(key != 0);
        let (_, color_count, texture_count, opacity_count) = key_counts(key);
        let (vs, fs) = match blending_shader_sources(key) {
            Ok(sources) => sources,
            Err(_) => {
                error!("unable to generate the blending shader {:x}", key);
                return None;
            }
        };
        let name = format!("blend_{:x}", key);
        let program = match device.create_program(&name, &vs, &fs, &[(0, "corner")]) {
            Ok(program) => program,
            Err(e) => {
                error!("{}", e);
                return None;
            }
        };

        device.use_program(program);
        let position = device.uniform_location(program, "position");
        let colors = array_locations(device, program, "colors", color_count);
        let samplers = array_locations(device, program, "textures", texture_count);
        for (unit, location) in samplers.iter().enumerate() {
            device.set_uniform_int(*location, unit as i32);
        }
        let texgens = array_locations(device, program, "texgen", texture_count);
        let opacities = array_locations(device, program, "opacities", opacity_count);

        Some(BlendingShader {
            key,
            program,
            color_count,
            texture_count,
            opacity_count,
            position,
            colors,
            texgens,
            opacities,
        })
    }
}

/// GL state tracked across the leaves of one draw.
struct DrawState<'a> {
    device: &'a mut dyn Device,
    shaders: &'a mut LruCache<u64, BlendingShader>,
    current_key: Option<u64>,
    bound_textures: SmallVec<[TextureId; 16]>,
    is_blending: Option<bool>,
    viewport: IntRect,
    fast_path: bool,
}

impl<'a> DrawState<'a> {
    fn set_blending(&mut self, blend: bool) {
        if self.is_blending != Some(blend) {
            self.device.set_blend_enabled(blend);
            self.is_blending = Some(blend);
        }
    }

    fn use_shader(&mut self, key: u64) -> bool {
        if self.current_key == Some(key) {
            return true;
        }
        if self.shaders.get(&key).is_none() {
            let shader = match BlendingShader::new(&mut *self.device, key) {
                Some(shader) => shader,
                None => return false,
            };
            if let Some(evicted) = self.shaders.insert(key, shader) {
                self.device.delete_program(evicted.program);
            }
        }
        match self.shaders.get(&key) {
            Some(shader) => {
                self.device.use_program(shader.program);
                self.current_key = Some(key);
                true
            }
            None => false,
        }
    }
}

pub struct BlendingTree {
    nodes: Vec<BlendingNode>,
    root: NodeIndex,
    layers: Vec<BlendingLayer>,
    layer_depth: usize,
    max_layer_depth: usize,
    shader_cache: LruCache<u64, BlendingShader>,
    unit_square: Option<VboId>,
    viewport: IntRect,
}

impl BlendingTree {
    pub fn new(limits: &DeviceLimits) -> BlendingTree {
        BlendingTree {
            nodes: vec![BlendingNode::DrawQuad],
            root: DRAW_QUAD_NODE,
            layers: Vec::with_capacity(MAX_QUAD_COUNT),
            layer_depth: 0,
            max_layer_depth: BlendingTree::max_layer_depth_for(limits),
            shader_cache: LruCache::new(SHADER_CACHE_CAPACITY),
            unit_square: None,
            viewport: Rect::new(Point2D::zero(), Size2D::zero()),
        }
    }

    /// The deepest layer stack one generated shader can blend.
    pub fn max_layer_depth_for(limits: &DeviceLimits) -> usize {
        // Four bits per layer in a 64 bit key.
        let mut depth = 16;
        depth = cmp::min(depth, limits.max_texture_units as usize);
        // Two sets of texture coordinates are packed into each varying.
        depth = cmp::min(depth, 2 * limits.max_varying_vectors as usize);
        // One vertex uniform per texture plus the quad position.
        depth = cmp::min(depth, (limits.max_vertex_uniform_vectors as usize).saturating_sub(1));
        // At most one fragment uniform (color or opacity) per layer.
        cmp::min(depth, limits.max_fragment_uniform_vectors as usize)
    }

    pub fn set_viewport(&mut self, viewport: IntRect) {
        self.viewport = viewport;
    }

    pub fn clear(&mut self) {
        self.nodes.truncate(1);
        self.root = DRAW_QUAD_NODE;
        self.layers.clear();
        self.layer_depth = 0;
    }

    pub fn quad_count(&self) -> usize {
        self.layers.len()
    }

    pub fn layer_depth(&self) -> usize {
        self.layer_depth
    }

    pub fn is_empty(&self) -> bool {
        self.layer_depth == 0
    }

    pub fn can_accept_more_quads(&self) -> bool {
        self.layers.len() < MAX_QUAD_COUNT && self.layer_depth < self.max_layer_depth
    }

    /// Inserts a solid color quad. `dest` is in GL viewport coordinates.
    pub fn insert_color(&mut self, color: [f32; 4], dest: &FloatRect, transfer_mode: TransferMode) {
        let full_viewport = Rect::new(Point2D::new(-1.0, -1.0), Size2D::new(2.0, 2.0));
        let dest = match intersect_rects(dest, &full_viewport) {
            Some(dest) => dest,
            None => return,
        };
        debug_assert!(self.can_accept_more_quads());

        let mut color = color;
        let mut transfer_mode = transfer_mode;
        if color[3] == 1.0 {
            transfer_mode = TransferMode::StraightCopy;
        } else if transfer_mode == TransferMode::UnmultipliedAlphaBlend {
            let alpha = color[3];
            for channel in &mut color[.. 3] {
                *channel *= alpha;
            }
            transfer_mode = TransferMode::PremultipliedAlphaBlend;
        }

        self.insert_layer(BlendingLayer {
            texture: TextureId::invalid(),
            params: color,
            opacity: 1.0,
            transfer_mode,
        }, &dest);
    }

    /// Inserts a textured quad. `texgen` scales and offsets viewport
    /// coordinates of `dest` into texture coordinates.
    pub fn insert_texture(&mut self,
                          texture: TextureId,
                          dest: &FloatRect,
                          texgen: &FloatRect,
                          opacity: f32,
                          transfer_mode: TransferMode) {
        if !texture.is_valid() {
            self.insert_color([0.0, 0.0, 0.0, 1.0], dest, TransferMode::StraightCopy);
            return;
        }
        let full_viewport = Rect::new(Point2D::new(-1.0, -1.0), Size2D::new(2.0, 2.0));
        let dest = match intersect_rects(dest, &full_viewport) {
            Some(dest) => dest,
            None => return,
        };
        debug_assert!(self.can_accept_more_quads());

        self.insert_layer(BlendingLayer {
            texture,
            params: [texgen.size.width, texgen.size.height, texgen.origin.x, texgen.origin.y],
            opacity,
            transfer_mode,
        }, &dest);
    }

    fn insert_layer(&mut self, layer: BlendingLayer, dest: &FloatRect) {
        let layer_index = self.layers.len();
        self.layers.push(layer);
        let root = self.root;
        self.root = self.insert_node(root, layer_index,
                                     dest.min_x(), dest.min_y(), dest.max_x(), dest.max_y(),
                                     Edges::empty(), 0);
    }

    fn push_node(&mut self, node: BlendingNode) -> NodeIndex {
        self.nodes.push(node);
        NodeIndex(self.nodes.len() - 1)
    }

    fn insert_node(&mut self,
                   index: NodeIndex,
                   layer: usize,
                   x1: f32, y1: f32, x2: f32, y2: f32,
                   degenerate_edges: Edges,
                   layer_depth: usize)
                   -> NodeIndex {
        match self.nodes[index.0] {
            BlendingNode::DrawQuad => {
                let mut node = self.push_node(BlendingNode::PushLayer { child: DRAW_QUAD_NODE, layer });
                if !degenerate_edges.contains(Edges::LEFT) {
                    node = self.push_node(BlendingNode::HorizontalSplit {
                        split_x: x1, left: DRAW_QUAD_NODE, right: node,
                    });
                }
                if !degenerate_edges.contains(Edges::BOTTOM) {
                    node = self.push_node(BlendingNode::VerticalSplit {
                        split_y: y2, top: node, bottom: DRAW_QUAD_NODE,
                    });
                }
                if !degenerate_edges.contains(Edges::RIGHT) {
                    node = self.push_node(BlendingNode::HorizontalSplit {
                        split_x: x2, left: node, right: DRAW_QUAD_NODE,
                    });
                }
                if !degenerate_edges.contains(Edges::TOP) {
                    node = self.push_node(BlendingNode::VerticalSplit {
                        split_y: y1, top: DRAW_QUAD_NODE, bottom: node,
                    });
                }
                self.layer_depth = cmp::max(self.layer_depth, 1 + layer_depth);
                node
            }
            BlendingNode::HorizontalSplit { split_x, mut left, mut right } => {
                if (x2 - split_x).abs() < EPSILON {
                    left = self.insert_node(left, layer, x1, y1, x2, y2,
                                            degenerate_edges | Edges::RIGHT, layer_depth);
                } else if (x1 - split_x).abs() < EPSILON {
                    right = self.insert_node(right, layer, x1, y1, x2, y2,
                                             degenerate_edges | Edges::LEFT, layer_depth);
                } else if x2 < split_x {
                    left = self.insert_node(left, layer, x1, y1, x2, y2, degenerate_edges, layer_depth);
                } else if x1 > split_x {
                    right = self.insert_node(right, layer, x1, y1, x2, y2, degenerate_edges, layer_depth);
                } else {
                    left = self.insert_node(left, layer, x1, y1, split_x, y2,
                                            degenerate_edges | Edges::RIGHT, layer_depth);
                    right = self.insert_node(right, layer, split_x, y1, x2, y2,
                                             degenerate_edges | Edges::LEFT, layer_depth);
                }
                self.nodes[index.0] = BlendingNode::HorizontalSplit { split_x, left, right };
                index
            }
            BlendingNode::VerticalSplit { split_y, mut top, mut bottom } => {
                if (y2 - split_y).abs() < EPSILON {
                    top = self.insert_node(top, layer, x1, y1, x2, y2,
                                           degenerate_edges | Edges::BOTTOM, layer_depth);
                } else if (y1 - split_y).abs() < EPSILON {
                    bottom = self.insert_node(bottom, layer, x1, y1, x2, y2,
                                              degenerate_edges | Edges::TOP, layer_depth);
                } else if y2 < split_y {
                    top = self.insert_node(top, layer, x1, y1, x2, y2, degenerate_edges, layer_depth);
                } else if y1 > split_y {
                    bottom = self.insert_node(bottom, layer, x1, y1, x2, y2, degenerate_edges, layer_depth);
                } else {
                    top = self.insert_node(top, layer, x1, y1, x2, split_y,
                                           degenerate_edges | Edges::BOTTOM, layer_depth);
                    bottom = self.insert_node(bottom, layer, x1, split_y, x2, y2,
                                              degenerate_edges | Edges::TOP, layer_depth);
                }
                self.nodes[index.0] = BlendingNode::VerticalSplit { split_y, top, bottom };
                index
            }
            BlendingNode::PushLayer { child, layer: own_layer } => {
                let child = self.insert_node(child, layer, x1, y1, x2, y2,
                                             degenerate_edges, 1 + layer_depth);
                self.nodes[index.0] = BlendingNode::PushLayer { child, layer: own_layer };
                index
            }
        }
    }

    /// Blends every covered subspace into the framebuffer. GL state touched
    /// here is restored before returning.
    pub fn draw(&mut self, device: &mut dyn Device) {
        if self.layer_depth == 0 {
            return;
        }

        device.save_state();
        device.set_scissor(None);
        device.set_blend_func(BlendFactor::One, BlendFactor::OneMinusSrcAlpha);
        device.set_blend_equation_add();

        let unit_square = match self.unit_square {
            Some(vbo) => vbo,
            None => {
                let vbo = device.create_vertex_buffer(&UNIT_SQUARE);
                self.unit_square = Some(vbo);
                vbo
            }
        };
        device.bind_vertex_buffer(unit_square, 0, 2);

        let fast_path = device.supports_draw_texture();
        {
            let mut state = DrawState {
                device: &mut *device,
                shaders: &mut self.shader_cache,
                current_key: None,
                bound_textures: SmallVec::from_elem(TextureId::invalid(), self.layer_depth),
                is_blending: None,
                viewport: self.viewport,
                fast_path,
            };
            draw_node(&self.nodes, &self.layers, self.root, -1.0, -1.0, 1.0, 1.0, None, &mut state);
        }

        device.restore_state();
    }

    pub fn cleanup_gl_resources(&mut self, device: &mut dyn Device) {
        for shader in self.shader_cache.drain() {
            device.delete_program(shader.program);
        }
        if let Some(vbo) = self.unit_square.take() {
            device.delete_vertex_buffer(vbo);
        }
    }

    /// Forgets GL objects that died with the context.
    pub fn did_reset_rendering_context(&mut self) {
        self.unit_square = None;
        self.shader_cache.drain();
    }
}

fn draw_node(nodes: &[BlendingNode],
             layers: &[BlendingLayer],
             index: NodeIndex,
             x1: f32, y1: f32, x2: f32, y2: f32,
             top: Option<&LayerLink>,
             state: &mut DrawState) {
    match nodes[index.0] {
        BlendingNode::HorizontalSplit { split_x, left, right } => {
            if x1 < split_x {
                draw_node(nodes, layers, left, x1, y1, split_x, y2, top, state);
            }
            if x2 > split_x {
                draw_node(nodes, layers, right, split_x, y1, x2, y2, top, state);
            }
        }
        BlendingNode::VerticalSplit { split_y, top: upper, bottom } => {
            if y1 < split_y {
                draw_node(nodes, layers, upper, x1, y1, x2, split_y, top, state);
            }
            if y2 > split_y {
                draw_node(nodes, layers, bottom, x1, split_y, x2, y2, top, state);
            }
        }
        BlendingNode::PushLayer { child, layer } => {
            let layer = &layers[layer];
            // A straight copy hides everything below it.
            let previous = match layer.transfer_mode {
                TransferMode::StraightCopy => None,
                _ => top,
            };
            let mut shader_key = previous.map_or(0, |link| link.shader_key << 4);
            if !layer.texture.is_valid() {
                debug_assert!(layer.opacity == 1.0);
                debug_assert!(layer.transfer_mode != TransferMode::UnmultipliedAlphaBlend);
                shader_key |= COLOR_LAYER;
            } else {
                shader_key |= TEXTURE_LAYER;
                if layer.opacity != 1.0 {
                    shader_key |= HAS_OPACITY;
                }
                if layer.transfer_mode == TransferMode::UnmultipliedAlphaBlend {
                    shader_key |= NEEDS_MULTIPLY_ALPHA;
                }
            }
            let link = LayerLink { previous, shader_key, layer };
            draw_node(nodes, layers, child, x1, y1, x2, y2, Some(&link), state);
        }
        BlendingNode::DrawQuad => {
            if let Some(top) = top {
                draw_leaf(x1, y1, x2, y2, top, state);
            }
        }
    }
}

fn draw_leaf(x1: f32, y1: f32, x2: f32, y2: f32, top: &LayerLink, state: &mut DrawState) {
    if state.fast_path && top.previous.is_none() {
        let layer = top.layer;
        if layer.texture.is_valid() && layer.opacity == 1.0 {
            draw_texture_fast_path(x1, y1, x2, y2, layer, state);
            return;
        }
    }

    if !state.use_shader(top.shader_key) {
        return;
    }
    let shader = match state.shaders.get(&top.shader_key) {
        Some(shader) => shader,
        None => return,
    };
    debug_assert_eq!(shader.key, top.shader_key);

    let mut color_index = shader.color_count;
    let mut texture_index = shader.texture_count;
    let mut opacity_index = shader.opacity_count;
    let mut blend_into_framebuffer = true;
    let mut link = Some(top);
    while let Some(node) = link {
        let layer = node.layer;
        if !layer.texture.is_valid() {
            color_index -= 1;
            state.device.set_uniform_vec4(shader.colors[color_index], layer.params);
        } else {
            texture_index -= 1;
            if state.bound_textures[texture_index] != layer.texture {
                state.device.bind_texture(texture_index as u32, TextureTarget::Default, layer.texture);
                state.bound_textures[texture_index] = layer.texture;
            }
            state.device.set_uniform_vec4(shader.texgens[texture_index], layer.params);
            if layer.opacity != 1.0 {
                opacity_index -= 1;
                state.device.set_uniform_float(shader.opacities[opacity_index], layer.opacity);
            }
        }
        if layer.transfer_mode == TransferMode::StraightCopy {
            debug_assert!(node.previous.is_none());
            blend_into_framebuffer = false;
        }
        link = node.previous;
    }

    let position = shader.position;
    if state.is_blending != Some(blend_into_framebuffer) {
        state.device.set_blend_enabled(blend_into_framebuffer);
        state.is_blending = Some(blend_into_framebuffer);
    }
    state.device.set_uniform_vec4(position, [x2 - x1, y2 - y1, x1, y1]);
    state.device.draw_arrays(Primitive::TriangleFan, 0, 4);
}

fn draw_texture_fast_path(x1: f32, y1: f32, x2: f32, y2: f32,
                          layer: &BlendingLayer,
                          state: &mut DrawState) {
    state.set_blending(layer.transfer_mode != TransferMode::StraightCopy);
    let unmultiplied = layer.transfer_mode == TransferMode::UnmultipliedAlphaBlend;
    if unmultiplied {
        state.device.set_blend_func(BlendFactor::SrcAlpha, BlendFactor::OneMinusSrcAlpha);
    }

    // Keep in sync with the texgen in the generated vertex shaders.
    let texgen = &layer.params;
    let u1 = x1 * texgen[0] + texgen[2];
    let v1 = y1 * texgen[1] + texgen[3];
    let u2 = x2 * texgen[0] + texgen[2];
    let v2 = y2 * texgen[1] + texgen[3];

    // Viewport coordinates in [-1, 1] to window coordinates.
    let viewport = &state.viewport;
    let half_width = viewport.size.width as f32 / 2.0;
    let half_height = viewport.size.height as f32 / 2.0;
    let cx = viewport.origin.x as f32 + half_width;
    let cy = viewport.origin.y as f32 + half_height;
    let rect = DrawTextureRect {
        dst: [cx + half_width * x1, cy + half_height * y1,
              cx + half_width * x2, cy + half_height * y2],
        src: [u1, v1, u2, v2],
    };
    state.device.draw_texture(layer.texture, &rect);

    if unmultiplied {
        state.device.set_blend_func(BlendFactor::One, BlendFactor::OneMinusSrcAlpha);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording_device::{DrawCall, RecordingDevice};
    use fxhash::FxHashMap;
    use rand::{Rng, SeedableRng, XorShiftRng};

    type Color = [f32; 4];

    fn rect(x: f32, y: f32, w: f32, h: f32) -> FloatRect {
        Rect::new(Point2D::new(x, y), Size2D::new(w, h))
    }

    fn over(dst: Color, src: Color) -> Color {
        let k = 1.0 - src[3];
        [src[0] + k * dst[0], src[1] + k * dst[1], src[2] + k * dst[2], src[3] + k * dst[3]]
    }

    fn scale(c: Color, s: f32) -> Color {
        [c[0] * s, c[1] * s, c[2] * s, c[3] * s]
    }

    fn premultiply(c: Color) -> Color {
        [c[0] * c[3], c[1] * c[3], c[2] * c[3], c[3]]
    }

    /// Evaluates the color one recorded draw writes, by walking the layers of
    /// its shader key the way the generated fragment shader does.
    fn shaded_color(device: &RecordingDevice, draw: &DrawCall,
                    texels: &FxHashMap<TextureId, Color>) -> Color {
        if let Some((texture, _)) = draw.fast_path {
            return texels[&texture];
        }
        let program = device.program_for_draw(draw);
        let key = u64::from_str_radix(&program.name["blend_".len() ..], 16).unwrap();
        let (layers, _, _, _) = key_counts(key);
        let (mut ci, mut ti, mut oi) = (0, 0, 0);
        let mut accumulated = [0.0; 4];
        for i in 0 .. layers {
            let layer_key = (key >> (4 * (layers - i - 1))) & 0xf;
            let mut color = if layer_key & LAYER_TYPE_MASK == COLOR_LAYER {
                ci += 1;
                draw.uniforms[&format!("colors[{}]", ci - 1)].vec4()
            } else {
                ti += 1;
                let unit = (ti - 1) as u32;
                let texture = draw.textures.iter().find(|t| t.0 == unit).unwrap().1;
                texels[&texture]
            };
            if layer_key & NEEDS_MULTIPLY_ALPHA != 0 {
                color = premultiply(color);
            }
            if layer_key & HAS_OPACITY != 0 {
                oi += 1;
                color = scale(color, draw.uniforms[&format!("opacities[{}]", oi - 1)].float());
            }
            accumulated = if i == 0 { color } else { over(accumulated, color) };
        }
        accumulated
    }

    fn draw_bounds(draw: &DrawCall) -> FloatRect {
        if let Some((_, ref r)) = draw.fast_path {
            // Tests use a (-1,-1) 2x2 viewport so window and GL coordinates match.
            return rect(r.dst[0], r.dst[1], r.dst[2] - r.dst[0], r.dst[3] - r.dst[1]);
        }
        let p = draw.uniforms["position"].vec4();
        rect(p[2], p[3], p[0], p[1])
    }

    /// Composites the recorded draws and samples the result at `point`.
    fn framebuffer_at(device: &RecordingDevice, texels: &FxHashMap<TextureId, Color>,
                      background: Color, point: (f32, f32)) -> Color {
        let mut dst = background;
        for draw in &device.draws {
            if !draw_bounds(draw).contains(&Point2D::new(point.0, point.1)) {
                continue;
            }
            let src = shaded_color(device, draw, texels);
            dst = if !draw.blend_enabled {
                src
            } else if draw.blend_func.0 == BlendFactor::SrcAlpha {
                over(dst, premultiply(src))
            } else {
                over(dst, src)
            };
        }
        dst
    }

    fn assert_color_eq(actual: Color, expected: Color) {
        for i in 0 .. 4 {
            assert!((actual[i] - expected[i]).abs() < 1e-4,
                    "expected {:?}, got {:?}", expected, actual);
        }
    }

    fn new_tree(device: &RecordingDevice) -> BlendingTree {
        let mut tree = BlendingTree::new(&device.limits);
        tree.set_viewport(Rect::new(Point2D::new(-1, -1), Size2D::new(2, 2)));
        tree
    }

    #[test]
    fn max_layer_depth_follows_the_tightest_limit() {
        let mut limits = RecordingDevice::new().limits;
        assert_eq!(BlendingTree::max_layer_depth_for(&limits), 16);
        limits.max_varying_vectors = 3;
        assert_eq!(BlendingTree::max_layer_depth_for(&limits), 6);
        limits.max_vertex_uniform_vectors = 5;
        assert_eq!(BlendingTree::max_layer_depth_for(&limits), 4);
    }

    #[test]
    fn generated_shader_blends_layers_in_order() {
        let key = (COLOR_LAYER << 8) | ((TEXTURE_LAYER | HAS_OPACITY) << 4) |
                  (TEXTURE_LAYER | NEEDS_MULTIPLY_ALPHA);
        let (vs, fs) = blending_shader_sources(key).unwrap();
        assert!(vs.contains("uniform vec4 texgen[2];"));
        assert!(vs.contains("varying vec4 texcoords[1];"));
        assert!(vs.contains("texcoords[0].zw = vertex.xy * texgen[1].xy + texgen[1].zw;"));
        assert!(fs.contains("uniform vec4 colors[1];"));
        assert!(fs.contains("uniform float opacities[1];"));
        assert!(fs.contains("return (1.0 - color2.a) * color1 + color2;"));

        let colors = fs.find("layerColor = colors[0];").unwrap();
        let first_texture = fs.find("texture2D(textures[0], texcoords[0].xy)").unwrap();
        let second_texture = fs.find("texture2D(textures[1], texcoords[0].zw)").unwrap();
        assert!(colors < first_texture && first_texture < second_texture);
        assert!(fs.contains("layerColor = opacities[0] * layerColor;"));
        assert!(fs.contains("layerColor = vec4(layerColor.a * layerColor.rgb, layerColor.a);"));

        let (_, single) = blending_shader_sources(COLOR_LAYER).unwrap();
        assert!(!single.contains("blend("));
        assert!(single.contains("gl_FragColor = accumulatedColor;"));

        // Every single layer flavor yields a complete pair of sources.
        for layer_key in 1 .. 16u64 {
            let (vs, fs) = blending_shader_sources(layer_key).unwrap();
            assert!(vs.ends_with("}\n") && fs.ends_with("}\n"));
        }
    }

    #[test]
    fn translucent_quad_over_opaque_background() {
        let mut device = RecordingDevice::new();
        let mut tree = new_tree(&device);
        let blue = device.create_texture();
        let mut texels = FxHashMap::default();
        texels.insert(blue, [0.0, 0.0, 1.0, 1.0]);

        tree.insert_color([1.0, 0.0, 0.0, 1.0], &rect(-1.0, -1.0, 2.0, 2.0),
                          TransferMode::PremultipliedAlphaBlend);
        tree.insert_texture(blue, &rect(-0.5, -0.5, 1.0, 1.0), &rect(0.5, 0.5, 0.5, 0.5),
                            0.5, TransferMode::PremultipliedAlphaBlend);
        assert_eq!(tree.layer_depth(), 2);
        tree.draw(&mut device);

        // Four red borders around one blended center.
        assert_eq!(device.draws.len(), 5);
        assert!(device.draws.iter().all(|d| d.primitive == Primitive::TriangleFan && d.count == 4));
        let center = framebuffer_at(&device, &texels, [0.0; 4], (0.0, 0.0));
        assert_color_eq(center, [0.5, 0.0, 0.5, 1.0]);
        for &corner in &[(-0.75, -0.75), (0.75, 0.75), (-0.75, 0.75), (0.75, -0.75)] {
            assert_color_eq(framebuffer_at(&device, &texels, [0.0; 4], corner), [1.0, 0.0, 0.0, 1.0]);
        }

        // Opaque red replaces the framebuffer, the center blends in one pass.
        let center_draw = device.draws.iter()
            .find(|d| draw_bounds(d).contains(&Point2D::new(0.0, 0.0)))
            .unwrap();
        assert!(!center_draw.blend_enabled);
        assert_eq!(device.state_depth(), 0);
    }

    #[test]
    fn programs_are_cached_by_layer_stack() {
        let mut device = RecordingDevice::new();
        let mut tree = new_tree(&device);
        tree.insert_color([0.0, 0.5, 0.0, 0.5], &rect(-1.0, -1.0, 1.0, 1.0),
                          TransferMode::PremultipliedAlphaBlend);
        tree.insert_color([0.0, 0.0, 0.5, 0.5], &rect(0.0, 0.0, 1.0, 1.0),
                          TransferMode::PremultipliedAlphaBlend);
        tree.draw(&mut device);
        assert_eq!(device.programs.len(), 1);
        assert!(device.draws.iter().all(|d| d.blend_enabled));

        tree.clear();
        assert!(tree.is_empty());
        tree.insert_color([0.0, 0.0, 0.5, 0.5], &rect(0.0, 0.0, 1.0, 1.0),
                          TransferMode::PremultipliedAlphaBlend);
        tree.draw(&mut device);
        assert_eq!(device.programs.len(), 1);

        tree.cleanup_gl_resources(&mut device);
        assert!(device.programs.is_empty());
        assert!(device.vertex_buffers.is_empty());
    }

    #[test]
    fn quads_outside_the_viewport_are_dropped() {
        let device = RecordingDevice::new();
        let mut tree = new_tree(&device);
        tree.insert_color([1.0; 4], &rect(1.0, 1.0, 1.0, 1.0), TransferMode::StraightCopy);
        assert!(tree.is_empty());
        assert_eq!(tree.quad_count(), 0);
    }

    #[test]
    fn single_opaque_textures_take_the_fast_path() {
        let mut device = RecordingDevice::new();
        device.draw_texture_supported = true;
        let mut tree = new_tree(&device);
        let texture = device.create_texture();
        let mut texels = FxHashMap::default();
        texels.insert(texture, [0.2, 0.4, 0.6, 1.0]);

        tree.insert_texture(texture, &rect(-1.0, -1.0, 1.0, 2.0), &rect(0.5, 0.5, 0.5, 0.5),
                            1.0, TransferMode::StraightCopy);
        tree.draw(&mut device);
        assert_eq!(device.draws.len(), 1);
        let (id, r) = device.draws[0].fast_path.unwrap();
        assert_eq!(id, texture);
        assert_eq!(r.src, [0.0, 0.0, 0.5, 1.0]);
        assert!(device.programs.is_empty());
        assert_color_eq(framebuffer_at(&device, &texels, [0.0; 4], (-0.5, 0.0)), [0.2, 0.4, 0.6, 1.0]);
    }

    #[test]
    fn batched_draws_match_drawing_quads_in_order() {
        let mut rng = XorShiftRng::from_seed([7, 11, 13, 17]);
        for _ in 0 .. 20 {
            let mut device = RecordingDevice::new();
            let mut tree = new_tree(&device);
            let mut texels = FxHashMap::default();
            let mut reference: Vec<(FloatRect, Color, TransferMode)> = Vec::new();

            for _ in 0 .. 12 {
                if !tree.can_accept_more_quads() {
                    break;
                }
                // Quarter steps keep every edge exact in binary.
                let x0 = rng.gen_range(-4, 4) as f32 / 4.0;
                let y0 = rng.gen_range(-4, 4) as f32 / 4.0;
                let w = rng.gen_range(1, 5) as f32 / 4.0;
                let h = rng.gen_range(1, 5) as f32 / 4.0;
                let dest = rect(x0, y0, w, h);
                let clipped = match intersect_rects(&dest, &rect(-1.0, -1.0, 2.0, 2.0)) {
                    Some(clipped) => clipped,
                    None => continue,
                };
                let alpha = [1.0, 0.5, 0.25][rng.gen_range(0usize, 3)];
                let mode = [TransferMode::StraightCopy,
                            TransferMode::PremultipliedAlphaBlend,
                            TransferMode::UnmultipliedAlphaBlend][rng.gen_range(0usize, 3)];
                let rgb = [rng.gen_range(0, 5) as f32 / 4.0,
                           rng.gen_range(0, 5) as f32 / 4.0,
                           rng.gen_range(0, 5) as f32 / 4.0];

                if rng.gen() {
                    let mode = if mode == TransferMode::UnmultipliedAlphaBlend {
                        TransferMode::PremultipliedAlphaBlend
                    } else {
                        mode
                    };
                    let color = [rgb[0] * alpha, rgb[1] * alpha, rgb[2] * alpha, alpha];
                    tree.insert_color(color, &dest, mode);
                    reference.push((clipped, color, mode));
                } else {
                    let texture = device.create_texture();
                    let opacity = [1.0, 0.5][rng.gen_range(0usize, 2)];
                    let texel = if mode == TransferMode::UnmultipliedAlphaBlend {
                        [rgb[0], rgb[1], rgb[2], alpha]
                    } else {
                        [rgb[0] * alpha, rgb[1] * alpha, rgb[2] * alpha, alpha]
                    };
                    texels.insert(texture, texel);
                    tree.insert_texture(texture, &dest, &rect(0.5, 0.5, 0.5, 0.5), opacity, mode);
                    let mut color = if mode == TransferMode::UnmultipliedAlphaBlend {
                        premultiply(texel)
                    } else {
                        texel
                    };
                    color = scale(color, opacity);
                    reference.push((clipped, color, mode));
                }
            }
            tree.draw(&mut device);

            let background = [0.1, 0.2, 0.3, 1.0];
            for i in 0 .. 16 {
                for j in 0 .. 16 {
                    let point = ((2 * i + 1) as f32 / 16.0 - 1.0, (2 * j + 1) as f32 / 16.0 - 1.0);
                    let mut expected = background;
                    for &(ref r, color, mode) in &reference {
                        if r.contains(&Point2D::new(point.0, point.1)) {
                            expected = match mode {
                                TransferMode::StraightCopy => color,
                                _ => over(expected, color),
                            };
                        }
                    }
                    let actual = framebuffer_at(&device, &texels, background, point);
                    assert_color_eq(actual, expected);
                }
            }
        }
    }
}
