/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Background threads that paint tiles. Each thread keeps its own queue of
//! paint operations and always runs the one with the lowest priority value,
//! recomputed at every pick. Operations are handed over in batches, once per
//! frame.

use crate::options::RendererOptions;
use crate::paint_tile_operation::{OperationFilter, PaintTileOperation};
use crate::painter::{BaseRenderer, RasterRenderer};
use crate::resource_limits::ResourceLimits;
use crate::tiles_manager::TilesManager;
use crate::util::lock;
use std::io;
use std::mem;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long to hold back deferrable work once it is all that is left.
const DEFERRED_WAIT: Duration = Duration::from_secs(1);

/// Operations handed to a generator in one go. The filter, if any, drops
/// matching queued operations before the new ones are added.
#[derive(Default)]
pub struct PaintTileBatch {
    operations: Vec<PaintTileOperation>,
    filter: Option<OperationFilter>,
}

impl PaintTileBatch {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty() && self.filter.is_none()
    }
}

/// The queue one generator thread works through.
struct OperationQueue {
    operations: Vec<PaintTileOperation>,
    /// Set while only deferrable operations are known to be queued.
    deferred_mode: bool,
    defer_cutoff: i64,
}

impl OperationQueue {
    fn new(defer_cutoff: i64) -> OperationQueue {
        OperationQueue {
            operations: Vec::new(),
            deferred_mode: true,
            defer_cutoff,
        }
    }

    fn len(&self) -> usize {
        self.operations.len()
    }

    fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    fn remove_operations_for_filter(&mut self, filter: &OperationFilter) {
        self.operations.retain(|operation| !filter(operation));
    }

    /// Queues `operation`, replacing any operation for the same tile.
    fn add_or_update(&mut self, operation: PaintTileOperation, current_draw: u64) {
        let deferrable = operation.priority(current_draw) >= self.defer_cutoff;
        self.deferred_mode &= deferrable;

        self.operations.retain(|queued| !Arc::ptr_eq(queued.tile(), operation.tile()));
        self.operations.push(operation);
    }

    fn add_batches(&mut self, batches: Vec<PaintTileBatch>, current_draw: u64) {
        for batch in batches {
            if let Some(ref filter) = batch.filter {
                self.remove_operations_for_filter(filter);
            }
            for operation in batch.operations {
                self.add_or_update(operation, current_draw);
            }
        }
    }

    /// Takes the most urgent operation. Returns `None` when only deferrable
    /// operations remain and the queue just switched to deferred mode.
    fn pop_next(&mut self, current_draw: u64) -> Option<PaintTileOperation> {
        let mut best: Option<(usize, i64)> = None;
        for (index, operation) in self.operations.iter().enumerate() {
            let priority = operation.priority(current_draw);
            if !self.deferred_mode && priority >= self.defer_cutoff {
                continue;
            }

            // Ties go to the most recently queued operation.
            let better = match best {
                Some((_, best_priority)) => priority <= best_priority,
                None => true,
            };
            if better {
                best = Some((index, priority));
                if priority < 0 {
                    break;
                }
            }
        }

        self.deferred_mode = match best {
            Some((_, priority)) => priority >= self.defer_cutoff,
            None => true,
        };
        best.map(|(index, _)| self.operations.remove(index))
    }
}

struct Requests {
    batches: Vec<PaintTileBatch>,
    exit_requested: bool,
    flush_requested: bool,
}

struct Shared {
    requests: Mutex<Requests>,
    requested_operations: Condvar,
    batches_flushed: Condvar,
}

impl Shared {
    fn should_wait(requests: &Requests) -> bool {
        requests.batches.is_empty() && !requests.exit_requested && !requests.flush_requested
    }

    fn wait_for_requests<'a>(&self, requests: MutexGuard<'a, Requests>, timeout: Option<Duration>)
                             -> MutexGuard<'a, Requests> {
        if !Shared::should_wait(&requests) {
            return requests;
        }
        match timeout {
            Some(timeout) => {
                match self.requested_operations.wait_timeout(requests, timeout) {
                    Ok((requests, _)) => requests,
                    Err(poisoned) => poisoned.into_inner().0,
                }
            }
            None => lock(self.requested_operations.wait(requests)),
        }
    }
}

struct Worker {
    shared: Arc<Shared>,
    queue: OperationQueue,
    manager: Arc<TilesManager>,
    renderer: Box<dyn BaseRenderer>,
}

impl Worker {
    fn run(mut self) {
        loop {
            let (batches, flush_requested) = {
                let mut requests = lock(self.shared.requests.lock());
                if requests.exit_requested {
                    return;
                }
                (mem::replace(&mut requests.batches, Vec::new()), requests.flush_requested)
            };

            self.queue.add_batches(batches, self.manager.draw_gl_count());
            if flush_requested {
                lock(self.shared.requests.lock()).flush_requested = false;
                self.shared.batches_flushed.notify_all();
            }

            if self.queue.is_empty() {
                let requests = lock(self.shared.requests.lock());
                let _requests = self.shared.wait_for_requests(requests, None);
                continue;
            }

            match self.queue.pop_next(self.manager.draw_gl_count()) {
                Some(operation) => operation.run(&mut *self.renderer),
                None => {
                    debug!("deferring {} paint operations", self.queue.len());
                    let requests = lock(self.shared.requests.lock());
                    let _requests = self.shared.wait_for_requests(requests, Some(DEFERRED_WAIT));
                }
            }
        }
    }
}

/// One paint thread.
pub struct TexturesGenerator {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl TexturesGenerator {
    pub fn new(name: &str,
               options: &RendererOptions,
               manager: &Arc<TilesManager>,
               limits: &Arc<ResourceLimits>)
               -> io::Result<TexturesGenerator> {
        let shared = Arc::new(Shared {
            requests: Mutex::new(Requests {
                batches: Vec::new(),
                exit_requested: false,
                flush_requested: false,
            }),
            requested_operations: Condvar::new(),
            batches_flushed: Condvar::new(),
        });
        let worker = Worker {
            shared: Arc::clone(&shared),
            queue: OperationQueue::new(options.paint_priority.defer_cutoff),
            manager: Arc::clone(manager),
            renderer: Box::new(RasterRenderer::new(limits, options.tile_size)),
        };
        let thread = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || worker.run())?;

        Ok(TexturesGenerator {
            shared,
            thread: Some(thread),
        })
    }

    pub fn schedule_batch(&self, batch: PaintTileBatch) {
        let mut requests = lock(self.shared.requests.lock());
        requests.batches.push(batch);
        self.shared.requested_operations.notify_one();
    }

    /// Blocks until the thread has taken in every scheduled batch, so that
    /// filtered operations are gone from its queue.
    pub fn flush_pending_paint_tile_batches(&self) {
        let mut requests = lock(self.shared.requests.lock());
        requests.flush_requested = true;
        self.shared.requested_operations.notify_one();
        while requests.flush_requested && !requests.exit_requested {
            requests = lock(self.shared.batches_flushed.wait(requests));
        }
    }
}

impl Drop for TexturesGenerator {
    fn drop(&mut self) {
        lock(self.shared.requests.lock()).exit_requested = true;
        self.shared.requested_operations.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// The set of paint threads. Operations are collected into one pending
/// batch per thread and handed over when the frame commits them.
pub struct TexturesGeneratorList {
    generators: Vec<TexturesGenerator>,
    pending_batches: Vec<PaintTileBatch>,
}

impl TexturesGeneratorList {
    pub fn new(options: &RendererOptions,
               manager: &Arc<TilesManager>,
               limits: &Arc<ResourceLimits>)
               -> TexturesGeneratorList {
        let mut generators = Vec::with_capacity(options.texture_generator_threads);
        for index in 0 .. options.texture_generator_threads {
            match TexturesGenerator::new(&format!("TexGen{}", index), options, manager, limits) {
                Ok(generator) => generators.push(generator),
                Err(err) => error!("unable to start texture generator {}: {}", index, err),
            }
        }

        let pending_batches = generators.iter().map(|_| PaintTileBatch::default()).collect();
        TexturesGeneratorList {
            generators,
            pending_batches,
        }
    }

    pub fn thread_count(&self) -> usize {
        self.generators.len()
    }

    /// Operations waiting for the next commit.
    pub fn pending_operation_count(&self) -> usize {
        self.pending_batches.iter().map(|batch| batch.operations.len()).sum()
    }

    pub fn schedule_operation(&mut self, operation: PaintTileOperation) {
        if self.generators.is_empty() {
            return;
        }
        let tile = operation.tile();
        let index = (tile.x() + tile.y()).abs() as usize % self.generators.len();
        self.pending_batches[index].operations.push(operation);
    }

    /// Drops queued operations matching `filter`, on every thread, once the
    /// pending batches are committed.
    pub fn remove_operations_for_filter(&mut self, filter: OperationFilter) {
        for batch in &mut self.pending_batches {
            batch.operations.retain(|operation| !filter(operation));
            batch.filter = Some(Arc::clone(&filter));
        }
    }

    pub fn commit_paint_tile_batch_if_needed(&mut self) {
        for (generator, batch) in self.generators.iter().zip(self.pending_batches.iter_mut()) {
            if !batch.is_empty() {
                generator.schedule_batch(mem::replace(batch, PaintTileBatch::default()));
            }
        }
    }

    pub fn flush_pending_paint_tile_batches(&mut self) {
        self.commit_paint_tile_batch_if_needed();
        for generator in &self.generators {
            generator.flush_pending_paint_tile_batches();
        }
    }
}
