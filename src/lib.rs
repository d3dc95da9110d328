/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! A tiled GPU compositor.
//!
//! Content is split into square tiles that are painted on background
//! threads and uploaded into a shared pool of GL textures. Each frame,
//! [`WebViewState::draw_gl`](web_view_state/struct.WebViewState.html)
//! swaps in freshly painted tiles, schedules the missing ones and draws the
//! base surface followed by its composited layers.
//!
//! Image content for the blending tree goes through
//! [`ImageSurface`](image_surface/trait.ImageSurface.html): a ring of
//! buffers shared between a producer thread and the compositor.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;

extern crate euclid;
extern crate fxhash;
extern crate gleam;
#[cfg(unix)]
extern crate libc;
extern crate num_traits;
extern crate smallvec;
extern crate time;

pub mod blending_tree;
pub mod buffer_ring;
pub mod context_lost;
pub mod delegate_thread;
pub mod device;
pub mod draw_quad_data;
pub mod image_buffer;
pub mod image_surface;
pub mod lru_cache;
pub mod mapped_texture;
pub mod options;
pub mod paint_tile_operation;
pub mod painter;
pub mod profiler;
pub mod resource_limits;
pub mod shader_program;
pub mod surface_backing;
pub mod texture_generator;
pub mod tile;
pub mod tile_grid;
pub mod tile_texture;
pub mod tiles_manager;
pub mod util;
pub mod web_view_state;

#[cfg(test)]
mod recording_device;

pub use crate::device::{Device, GlDevice};
pub use crate::options::RendererOptions;
pub use crate::painter::{TileCanvas, TilePainter};
pub use crate::resource_limits::ResourceLimits;
pub use crate::tiles_manager::TilesManager;
pub use crate::web_view_state::{DrawStatus, FrameParams, FrameResult, WebViewState};
