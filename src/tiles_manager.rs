/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The bounded pool of tile textures shared by every tile of a view.
//!
//! Base content and layers draw from separate pools. The pools only change
//! on the compositor thread; painting threads touch the pixels of textures
//! already handed out, never the pool itself.

use crate::device::Device;
use crate::options::RendererOptions;
use crate::resource_limits::ResourceLimits;
use crate::tile_texture::{TextureOwner, TileTexture};
use crate::util::lock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use time::precise_time_s;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct TextureCounts {
    pub textures: usize,
    pub allocated_textures: usize,
    pub layer_textures: usize,
    pub allocated_layer_textures: usize,
}

struct TexturePools {
    textures: Vec<Arc<TileTexture>>,
    available_textures: Vec<Arc<TileTexture>>,
    layer_textures: Vec<Arc<TileTexture>>,
    available_layer_textures: Vec<Arc<TileTexture>>,
    layer_textures_remain: bool,
    last_time_layers_used: f64,
}

pub struct TilesManager {
    options: RendererOptions,
    limits: Arc<ResourceLimits>,
    high_end_gfx: AtomicBool,
    draw_gl_count: AtomicU64,
    pools: Mutex<TexturePools>,
}

fn allocate_textures(textures: &mut Vec<Arc<TileTexture>>, count: usize) {
    while textures.len() < count {
        textures.push(Arc::new(TileTexture::new()));
    }
}

fn discard_textures(textures: Vec<Arc<TileTexture>>, device: &mut dyn Device) {
    for texture in textures {
        texture.discard_backing_store(device);
    }
}

impl TilesManager {
    pub fn new(options: &RendererOptions, limits: &Arc<ResourceLimits>) -> TilesManager {
        let capacity = options.texture_allocation_for(true);
        TilesManager {
            options: options.clone(),
            limits: Arc::clone(limits),
            high_end_gfx: AtomicBool::new(options.high_end_gfx),
            draw_gl_count: AtomicU64::new(1),
            pools: Mutex::new(TexturePools {
                textures: Vec::with_capacity(capacity),
                available_textures: Vec::with_capacity(capacity),
                layer_textures: Vec::with_capacity(capacity),
                available_layer_textures: Vec::with_capacity(capacity),
                layer_textures_remain: true,
                last_time_layers_used: 0.0,
            }),
        }
    }

    pub fn options(&self) -> &RendererOptions {
        &self.options
    }

    pub fn resource_limits(&self) -> &Arc<ResourceLimits> {
        &self.limits
    }

    pub fn tile_size(&self) -> i32 {
        self.options.tile_size
    }

    pub fn high_end_gfx(&self) -> bool {
        self.high_end_gfx.load(Ordering::Relaxed)
    }

    pub fn set_high_end_gfx(&self, high_end: bool) {
        self.high_end_gfx.store(high_end, Ordering::Relaxed);
    }

    pub fn max_texture_allocation(&self) -> usize {
        self.options.texture_allocation_for(self.high_end_gfx())
    }

    pub fn draw_gl_count(&self) -> u64 {
        self.draw_gl_count.load(Ordering::SeqCst)
    }

    pub fn inc_draw_gl_count(&self) {
        self.draw_gl_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Snapshots the pools for this frame. Textures handed out during the
    /// frame are taken from the snapshot.
    pub fn gather_textures(&self) {
        let mut pools = lock(self.pools.lock());
        pools.available_textures = pools.textures.clone();
        pools.available_layer_textures = pools.layer_textures.clone();
        pools.layer_textures_remain = true;
    }

    pub fn available_texture_count(&self) -> usize {
        let pools = lock(self.pools.lock());
        pools.available_textures.len() + pools.available_layer_textures.len()
    }

    /// Picks a texture for `owner`: an unowned one if there is any,
    /// otherwise the one whose owner was prepared the longest ago, as long
    /// as that was before the previous frame. Textures `owner` already
    /// holds are never considered.
    pub fn get_available_texture(&self,
                                 owner: &Arc<dyn TextureOwner>,
                                 is_layer_tile: bool)
                                 -> Option<Arc<TileTexture>> {
        let owner_id = owner.owner_id();
        let texture = {
            let mut pools = lock(self.pools.lock());
            let mut oldest_draw_count = self.draw_gl_count().saturating_sub(1);
            let mut farthest = None;
            {
                let pool = if is_layer_tile {
                    &pools.available_layer_textures
                } else {
                    &pools.available_textures
                };
                for (index, texture) in pool.iter().enumerate() {
                    let current_owner = match texture.owner() {
                        Some(current_owner) => current_owner,
                        None => {
                            farthest = Some(index);
                            break;
                        }
                    };
                    if current_owner.owner_id() == owner_id {
                        continue;
                    }
                    let draw_count = current_owner.draw_count();
                    if oldest_draw_count > draw_count {
                        farthest = Some(index);
                        oldest_draw_count = draw_count;
                    }
                }
            }

            match farthest {
                Some(index) if is_layer_tile => pools.available_layer_textures.remove(index),
                Some(index) => pools.available_textures.remove(index),
                None => {
                    if is_layer_tile {
                        // Layers stop asking for repaints until the next frame.
                        pools.layer_textures_remain = false;
                    }
                    debug!("no texture available for {} tile",
                           if is_layer_tile { "a layer" } else { "a base" });
                    return None;
                }
            }
        };

        texture.set_owner(Some(owner));
        Some(texture)
    }

    pub fn layer_textures_remain(&self) -> bool {
        lock(self.pools.lock()).layer_textures_remain
    }

    pub fn current_texture_count(&self) -> usize {
        lock(self.pools.lock()).textures.len()
    }

    pub fn current_layer_texture_count(&self) -> usize {
        lock(self.pools.lock()).layer_textures.len()
    }

    /// Grows the base pool to `count` textures. It never shrinks here.
    pub fn set_current_texture_count(&self, count: usize) {
        let count = count.min(self.max_texture_allocation());
        let mut pools = lock(self.pools.lock());
        if pools.textures.len() >= count {
            return;
        }
        debug!("growing the tile texture pool to {}", count);
        allocate_textures(&mut pools.textures, count);
    }

    /// Grows the layer pool to `count` textures. Asking for none frees the
    /// pool once layers have been unused for a while.
    pub fn set_current_layer_texture_count(&self, device: &mut dyn Device, count: usize) {
        self.set_current_layer_texture_count_at(device, count, precise_time_s());
    }

    fn set_current_layer_texture_count_at(&self, device: &mut dyn Device, count: usize, now: f64) {
        let count = count.min(self.max_texture_allocation());
        let mut pools = lock(self.pools.lock());

        if count == 0 {
            if pools.layer_textures.is_empty() ||
               now - pools.last_time_layers_used < self.options.layer_textures_destroy_timeout {
                return;
            }
            debug!("layers unused for {:.0}s, freeing their textures",
                   now - pools.last_time_layers_used);
            let textures = std::mem::replace(&mut pools.layer_textures, Vec::new());
            pools.available_layer_textures.clear();
            drop(pools);
            discard_textures(textures, device);
            return;
        }

        pools.last_time_layers_used = now;
        if pools.layer_textures.len() >= count {
            return;
        }
        debug!("growing the layer texture pool to {}", count);
        allocate_textures(&mut pools.layer_textures, count);
    }

    pub fn gather_textures_numbers(&self) -> TextureCounts {
        let pools = lock(self.pools.lock());
        TextureCounts {
            textures: pools.textures.len(),
            allocated_textures: pools.textures.iter().filter(|t| t.has_texture()).count(),
            layer_textures: pools.layer_textures.len(),
            allocated_layer_textures: pools.layer_textures.iter().filter(|t| t.has_texture()).count(),
        }
    }

    /// Frees every texture except those held by the most recently drawn
    /// tiles. Used when memory runs low. The cutoff comes from the base pool
    /// and applies to both pools.
    pub fn delete_old_textures(&self, device: &mut dyn Device) {
        let mut pools = lock(self.pools.lock());
        let spared_draw_count = pools.textures.iter()
            .filter_map(|texture| texture.owner())
            .map(|owner| owner.draw_count())
            .max()
            .unwrap_or(0);

        let is_spared = |texture: &Arc<TileTexture>| {
            texture.owner().map_or(false, |owner| owner.draw_count() >= spared_draw_count)
        };
        let (kept, mut deleted): (Vec<_>, Vec<_>) =
            pools.textures.drain(..).partition(|texture| is_spared(texture));
        pools.textures = kept;
        let (kept_layers, deleted_layers): (Vec<_>, Vec<_>) =
            pools.layer_textures.drain(..).partition(|texture| is_spared(texture));
        pools.layer_textures = kept_layers;
        deleted.extend(deleted_layers);

        pools.available_textures.clear();
        pools.available_layer_textures.clear();
        drop(pools);

        debug!("deleting {} old tile textures", deleted.len());
        discard_textures(deleted, device);
    }

    pub fn delete_all_textures(&self, device: &mut dyn Device) {
        let mut pools = lock(self.pools.lock());
        let mut textures = std::mem::replace(&mut pools.textures, Vec::new());
        textures.extend(std::mem::replace(&mut pools.layer_textures, Vec::new()));
        pools.available_textures.clear();
        pools.available_layer_textures.clear();
        drop(pools);
        discard_textures(textures, device);
    }

    /// The GL context went away. Every texture that had GL state gives it
    /// up along with its owner.
    pub fn did_reset_rendering_context(&self) {
        let textures: Vec<_> = {
            let pools = lock(self.pools.lock());
            pools.textures.iter().chain(pools.layer_textures.iter()).cloned().collect()
        };
        for texture in textures {
            texture.did_reset_rendering_context();
        }
    }
}
