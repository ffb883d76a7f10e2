// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::{
    panic::AssertUnwindSafe,
    sync::{
        mpsc::{Receiver, SyncSender},
        Arc, Mutex,
    },
    thread::JoinHandle,
};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed pool of I/O worker threads fed by a bounded queue.
///
/// Replaces per-I/O task spawning: under load, submitters block on the full
/// queue instead of growing concurrency without bound. Completion callbacks
/// run on these threads, so they must be reentrant with user code.
pub struct WorkerPool {
    tx: Option<SyncSender<Job>>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    #[must_use]
    pub fn new(worker_count: usize, queue_depth: usize) -> Self {
        let (tx, rx) = std::sync::mpsc::sync_channel::<Job>(queue_depth);
        let rx = Arc::new(Mutex::new(rx));

        let threads = (0..worker_count.max(1))
            .map(|idx| {
                let rx = rx.clone();

                std::thread::Builder::new()
                    .name(format!("seglog-io-{idx}"))
                    .spawn(move || Self::run(&rx))
                    .expect("should spawn I/O worker")
            })
            .collect();

        Self {
            tx: Some(tx),
            threads,
        }
    }

    fn run(rx: &Mutex<Receiver<Job>>) {
        loop {
            let job = match rx.lock().expect("lock is poisoned").recv() {
                Ok(job) => job,
                Err(_) => return,
            };

            // a panicking job must not take the worker down with it
            if std::panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                log::error!("I/O worker job panicked");
            }
        }
    }

    /// Enqueues a job, blocking while the queue is full.
    pub fn execute(&self, job: Job) {
        if let Some(tx) = &self.tx {
            // send only fails once all workers are gone, which only
            // happens during shutdown
            if tx.send(job).is_err() {
                log::warn!("I/O job submitted during worker pool shutdown was dropped");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // closing the channel drains the queue, then stops the workers
        drop(self.tx.take());

        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                log::error!("I/O worker panicked outside a job");
            }
        }

        log::trace!("I/O worker pool shut down");
    }
}
