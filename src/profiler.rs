/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use crate::util::IntRect;
use euclid::Size2D;
use std::collections::vec_deque::VecDeque;
use std::f32;
use time::precise_time_ns;

/// Height of each indicator bar, in pixels.
pub const FPS_INDICATOR_HEIGHT: i32 = 10;
/// A full width bar means this many frames per second.
pub const MAX_FPS_VALUE: f64 = 60.0;
const COLLECTION_SWAPPED_COUNTER_MODULE: usize = 10;
const MAX_FRAME_SAMPLES: usize = 120;

pub trait ProfileCounter {
    fn description(&self) -> &'static str;
    fn value(&self) -> String;
}

#[derive(Clone, Debug)]
pub struct IntProfileCounter {
    description: &'static str,
    value: usize,
}

impl IntProfileCounter {
    pub fn new(description: &'static str) -> IntProfileCounter {
        IntProfileCounter {
            description,
            value: 0,
        }
    }

    pub fn reset(&mut self) {
        self.value = 0;
    }

    #[inline(always)]
    pub fn inc(&mut self) {
        self.value += 1;
    }

    #[inline(always)]
    pub fn add(&mut self, amount: usize) {
        self.value += amount;
    }

    #[inline(always)]
    pub fn set(&mut self, amount: usize) {
        self.value = amount;
    }

    pub fn get(&self) -> usize {
        self.value
    }
}

impl ProfileCounter for IntProfileCounter {
    fn description(&self) -> &'static str {
        self.description
    }

    fn value(&self) -> String {
        format!("{}", self.value)
    }
}

#[derive(Clone, Debug)]
pub struct TimeProfileCounter {
    description: &'static str,
    nanoseconds: u64,
    invert: bool,
}

impl TimeProfileCounter {
    pub fn new(description: &'static str, invert: bool) -> TimeProfileCounter {
        TimeProfileCounter {
            description,
            nanoseconds: 0,
            invert,
        }
    }

    pub fn reset(&mut self) {
        self.nanoseconds = 0;
    }

    pub fn set(&mut self, ns: u64) {
        self.nanoseconds = ns;
    }

    pub fn get(&self) -> u64 {
        self.nanoseconds
    }

    pub fn profile<T, F>(&mut self, callback: F) -> T where F: FnOnce() -> T {
        let t0 = precise_time_ns();
        let val = callback();
        let t1 = precise_time_ns();
        self.nanoseconds += t1 - t0;
        val
    }
}

impl ProfileCounter for TimeProfileCounter {
    fn description(&self) -> &'static str {
        self.description
    }

    fn value(&self) -> String {
        if self.invert {
            format!("{:.2} fps", 1000000000.0 / self.nanoseconds as f64)
        } else {
            format!("{:.2} ms", self.nanoseconds as f64 / 1000000.0)
        }
    }
}

/// Per-frame counters of the compositor. Reset at the start of every frame
/// except `frame_counter` and `frame_time`.
#[derive(Clone, Debug)]
pub struct FrameProfileCounters {
    pub frame_counter: IntProfileCounter,
    pub frame_time: TimeProfileCounter,
    pub surfaces_prepared: IntProfileCounter,
    pub surfaces_drawn: IntProfileCounter,
    pub paints_scheduled: IntProfileCounter,
    pub available_textures: IntProfileCounter,
    pub draw_time: TimeProfileCounter,
}

impl FrameProfileCounters {
    pub fn new() -> FrameProfileCounters {
        FrameProfileCounters {
            frame_counter: IntProfileCounter::new("Frame"),
            frame_time: TimeProfileCounter::new("FPS", true),
            surfaces_prepared: IntProfileCounter::new("Surfaces Prepared"),
            surfaces_drawn: IntProfileCounter::new("Surfaces Drawn"),
            paints_scheduled: IntProfileCounter::new("Paints Scheduled"),
            available_textures: IntProfileCounter::new("Available Textures"),
            draw_time: TimeProfileCounter::new("Compositor CPU Time", false),
        }
    }

    pub fn reset(&mut self) {
        self.surfaces_prepared.reset();
        self.surfaces_drawn.reset();
        self.paints_scheduled.reset();
        self.available_textures.reset();
        self.draw_time.reset();
    }

    pub fn log(&self) {
        let counters: [&dyn ProfileCounter; 7] = [
            &self.frame_counter,
            &self.frame_time,
            &self.surfaces_prepared,
            &self.surfaces_drawn,
            &self.paints_scheduled,
            &self.available_textures,
            &self.draw_time,
        ];
        for counter in &counters {
            debug!("{}: {}", counter.description(), counter.value());
        }
    }
}

#[derive(Debug, PartialEq)]
pub struct FrameStats {
    pub min_ms: f32,
    pub mean_ms: f32,
    pub max_ms: f32,
}

/// One solid bar of the on-screen frame indicator, in window coordinates.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct IndicatorBar {
    pub rect: IntRect,
    pub color: [f32; 4],
}

/// Keeps recent frame intervals and lays out the visual indicator: a red
/// bar whose length tracks the frame rate and a green bar that advances
/// every time a new layer collection is swapped in.
pub struct FrameIndicator {
    previous_draw_ns: Option<u64>,
    samples: VecDeque<f32>,
    swapped_counter: usize,
}

impl FrameIndicator {
    pub fn new() -> FrameIndicator {
        FrameIndicator {
            previous_draw_ns: None,
            samples: VecDeque::with_capacity(MAX_FRAME_SAMPLES),
            swapped_counter: 0,
        }
    }

    /// Records a frame drawn at `now_ns` and returns the bars to draw over
    /// the top of `rect`.
    pub fn next_frame(&mut self,
                      now_ns: u64,
                      collections_swapped: bool,
                      rect: &IntRect)
                      -> Vec<IndicatorBar> {
        let delta_ns = match self.previous_draw_ns {
            Some(previous) if now_ns > previous => now_ns - previous,
            _ => 0,
        };
        self.previous_draw_ns = Some(now_ns);
        if delta_ns > 0 {
            if self.samples.len() == MAX_FRAME_SAMPLES {
                self.samples.pop_back();
            }
            self.samples.push_front((delta_ns as f64 / 1000000.0) as f32);
        }

        if collections_swapped {
            self.swapped_counter = (self.swapped_counter + 1) % COLLECTION_SWAPPED_COUNTER_MODULE;
        }

        let fps_ratio = if delta_ns > 0 {
            (1000000000.0 / delta_ns as f64) / MAX_FPS_VALUE
        } else {
            0.0
        };
        let swap_ratio = (self.swapped_counter as f64 + 1.0) /
            COLLECTION_SWAPPED_COUNTER_MODULE as f64;

        let mut fps_row = *rect;
        fps_row.size.height = FPS_INDICATOR_HEIGHT;
        let mut swap_row = fps_row;
        swap_row.origin.y += FPS_INDICATOR_HEIGHT;

        vec![
            IndicatorBar { rect: fps_row, color: [1.0, 1.0, 1.0, 1.0] },
            IndicatorBar { rect: scaled_width(&fps_row, fps_ratio), color: [1.0, 0.0, 0.0, 1.0] },
            IndicatorBar { rect: swap_row, color: [1.0, 1.0, 1.0, 1.0] },
            IndicatorBar { rect: scaled_width(&swap_row, swap_ratio), color: [0.0, 1.0, 0.0, 1.0] },
        ]
    }

    pub fn stats(&self) -> FrameStats {
        let mut stats = FrameStats {
            min_ms: f32::MAX,
            mean_ms: 0.0,
            max_ms: -f32::MAX,
        };

        for value in &self.samples {
            stats.min_ms = stats.min_ms.min(*value);
            stats.mean_ms += *value;
            stats.max_ms = stats.max_ms.max(*value);
        }

        if !self.samples.is_empty() {
            stats.mean_ms /= self.samples.len() as f32;
        }

        stats
    }
}

fn scaled_width(rect: &IntRect, ratio: f64) -> IntRect {
    let width = (rect.size.width as f64 * ratio) as i32;
    IntRect::new(rect.origin, Size2D::new(width, rect.size.height))
}
