//! Fixed-size worker pool for indexer and query jobs.
//!
//! Two lanes feed the workers: dump jobs go through the boosted lane
//! and are picked up ahead of queued index jobs; everything else is
//! FIFO.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct JobPool {
    high: Sender<Job>,
    normal: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl JobPool {
    pub fn new(threads: usize) -> Self {
        let threads = threads.max(1);
        let (high_tx, high_rx) = unbounded::<Job>();
        let (normal_tx, normal_rx) = unbounded::<Job>();

        let workers = (0..threads)
            .map(|index| {
                let high = high_rx.clone();
                let normal = normal_rx.clone();
                std::thread::Builder::new()
                    .name(format!("job-pool-{index}"))
                    .spawn(move || worker(high, normal))
                    .expect("failed to spawn pool worker")
            })
            .collect();

        Self {
            high: high_tx,
            normal: normal_tx,
            workers,
        }
    }

    pub fn spawn<F: FnOnce() + Send + 'static>(&self, boosted: bool, job: F) {
        let sender = if boosted { &self.high } else { &self.normal };
        // Send only fails after shutdown, when no more work is accepted.
        let _ = sender.send(Box::new(job));
    }

    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Close the lanes and wait for workers to drain them.
    pub fn shutdown(&mut self) {
        // Dropping the senders disconnects the channels.
        let (dead_high, _) = unbounded();
        let (dead_normal, _) = unbounded();
        self.high = dead_high;
        self.normal = dead_normal;
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for JobPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker(high: Receiver<Job>, normal: Receiver<Job>) {
    loop {
        // Boosted lane first.
        if let Ok(job) = high.try_recv() {
            job();
            continue;
        }
        let job = crossbeam_channel::select! {
            recv(high) -> msg => msg.ok(),
            recv(normal) -> msg => msg.ok(),
        };
        match job {
            Some(job) => job(),
            None => {
                // Disconnected: drain whatever is left, then exit.
                while let Ok(job) = high.try_recv() {
                    job();
                }
                while let Ok(job) = normal.try_recv() {
                    job();
                }
                return;
            }
        }
    }
}
