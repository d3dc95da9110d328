/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Runs closures, in order, on one dedicated worker thread.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send>;

enum Message {
    Run(Job),
    Exit,
}

pub struct DelegateThread {
    sender: SyncSender<Message>,
    scheduled: usize,
    completed: Arc<AtomicUsize>,
    thread: Option<JoinHandle<()>>,
}

impl DelegateThread {
    pub fn new(name: &str, capacity: usize) -> io::Result<DelegateThread> {
        let (sender, receiver) = mpsc::sync_channel(capacity);
        let completed = Arc::new(AtomicUsize::new(0));
        let worker_completed = Arc::clone(&completed);
        let thread = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || run_worker(receiver, worker_completed))?;

        Ok(DelegateThread {
            sender,
            scheduled: 0,
            completed,
            thread: Some(thread),
        })
    }

    pub fn has_work(&self) -> bool {
        self.scheduled != self.completed.load(Ordering::Acquire)
    }

    /// Queues `job` without waiting for it. Blocks only while the queue is
    /// full.
    pub fn post<F: FnOnce() + Send + 'static>(&mut self, job: F) {
        self.scheduled += 1;
        if self.sender.send(Message::Run(Box::new(job))).is_err() {
            error!("delegate thread is gone, dropping work");
            self.scheduled -= 1;
        }
    }

    /// Runs `job` on the worker and waits for its result. Returns `None` if
    /// the worker died before answering.
    pub fn call<R, F>(&mut self, job: F) -> Option<R>
        where R: Send + 'static, F: FnOnce() -> R + Send + 'static
    {
        let (reply_sender, reply) = mpsc::channel();
        self.post(move || {
            let _ = reply_sender.send(job());
        });
        reply.recv().ok()
    }

    /// Waits for all queued work to finish.
    pub fn finish(&mut self) {
        if !self.has_work() {
            return;
        }
        let _ = self.call(|| ());
    }
}

fn run_worker(receiver: Receiver<Message>, completed: Arc<AtomicUsize>) {
    while let Ok(Message::Run(job)) = receiver.recv() {
        job();
        completed.fetch_add(1, Ordering::Release);
    }
}

impl Drop for DelegateThread {
    fn drop(&mut self) {
        let _ = self.sender.send(Message::Exit);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
