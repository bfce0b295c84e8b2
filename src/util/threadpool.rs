use crossbeam::channel::{unbounded, Sender};
use std::thread::JoinHandle;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// A small process-wide pool for background tasks that must stay off the
/// event loop, such as memory and CPU sampling. Tasks are fire-and-forget;
/// completion is observed through atomics the task itself updates.
pub struct ThreadPool {
    tx: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(threads: usize) -> Self {
        let (tx, rx) = unbounded::<Task>();
        let workers = (0..threads.max(1))
            .map(|_| {
                let rx = rx.clone();
                std::thread::spawn(move || {
                    for task in rx.iter() {
                        task();
                    }
                })
            })
            .collect();
        Self { tx: Some(tx), workers }
    }

    /// Queues a task for execution on some pool thread. Never blocks.
    pub fn execute<F: FnOnce() + Send + 'static>(&self, task: F) {
        if let Some(tx) = &self.tx {
            // The receiver outlives the sender, so this cannot fail.
            let _ = tx.send(Box::new(task));
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.tx.take());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn executes_all_tasks() {
        let pool = ThreadPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let counter = counter.clone();
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(pool); // joins the workers
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }
}
