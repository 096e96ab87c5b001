// Copyright 2026 The cosched Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Pool of parked OS threads backing the processor run loops

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{Builder, JoinHandle};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A fixed set of parked threads plus an overflow list of ad-hoc "free"
/// threads created whenever every parked slot is busy.
pub struct ThreadPool {
    parked: Vec<Arc<ParkedThread>>,
    free: Mutex<Vec<FreeThread>>,
}

struct ParkedThread {
    slot: Mutex<Slot>,
    work_cv: Condvar,
    join_cv: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
}

struct Slot {
    task: Option<Task>,
    running: bool,
    stopped: bool,
}

struct FreeThread {
    finished: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ParkedThread {
    fn routine(&self) {
        loop {
            let task = {
                let mut slot = self.slot.lock().unwrap();
                slot.running = false;
                self.join_cv.notify_all();
                while slot.task.is_none() && !slot.stopped {
                    slot = self.work_cv.wait(slot).unwrap();
                }
                if slot.stopped {
                    return;
                }
                slot.running = true;
                slot.task.take().expect("woken without a task")
            };

            task();
        }
    }

    /// Offers a task; refused when the slot is busy or stopped.
    fn run(&self, task: Task) -> Result<(), Task> {
        let mut slot = self.slot.lock().unwrap();
        if slot.stopped || slot.running || slot.task.is_some() {
            return Err(task);
        }
        slot.task = Some(task);
        self.work_cv.notify_all();
        Ok(())
    }

    fn join(&self) {
        let mut slot = self.slot.lock().unwrap();
        while slot.running || slot.task.is_some() {
            slot = self.join_cv.wait(slot).unwrap();
        }
    }

    fn stop(&self) {
        let mut slot = self.slot.lock().unwrap();
        slot.stopped = true;
        self.work_cv.notify_all();
    }
}

impl ThreadPool {
    pub fn new(size: usize) -> ThreadPool {
        assert!(size >= 1, "thread pool needs at least one slot");

        let parked = (0..size)
            .map(|i| {
                let parked = Arc::new(ParkedThread {
                    slot: Mutex::new(Slot {
                        task: None,
                        running: false,
                        stopped: false,
                    }),
                    work_cv: Condvar::new(),
                    join_cv: Condvar::new(),
                    thread: Mutex::new(None),
                });

                let handle = {
                    let parked = parked.clone();
                    Builder::new()
                        .name(format!("pool-{}", i))
                        .spawn(move || parked.routine())
                        .expect("failed to spawn a pool thread")
                };
                *parked.thread.lock().unwrap() = Some(handle);

                parked
            })
            .collect();

        ThreadPool {
            parked,
            free: Mutex::new(Vec::new()),
        }
    }

    /// Hands `task` to the first idle parked thread; when every slot is
    /// busy, a dedicated free thread runs it instead.
    pub fn run(&self, task: Task) {
        let mut task = task;
        for parked in &self.parked {
            match parked.run(task) {
                Ok(()) => return,
                Err(back) => task = back,
            }
        }

        self.create_free_thread(task);
        self.join_completed();
    }

    /// Waits for every parked slot to go idle, then reaps all free threads.
    pub fn join(&self) {
        for parked in &self.parked {
            parked.join();
        }
        self.join_all_free();
    }

    /// Signals every parked slot to terminate after its current task and
    /// joins everything, overflow included.
    pub fn stop_and_join(&self) {
        for parked in &self.parked {
            parked.stop();
        }
        for parked in &self.parked {
            if let Some(handle) = parked.thread.lock().unwrap().take() {
                let _ = handle.join();
            }
        }
        self.join_all_free();
    }

    fn create_free_thread(&self, task: Task) {
        let finished = Arc::new(AtomicBool::new(false));
        let handle = {
            let finished = finished.clone();
            Builder::new()
                .name("pool-free".to_owned())
                .spawn(move || {
                    task();
                    finished.store(true, Ordering::Release);
                })
                .expect("failed to spawn a free thread")
        };

        self.free.lock().unwrap().push(FreeThread {
            finished,
            thread: Some(handle),
        });
    }

    // Opportunistic garbage collection of finished free threads.
    fn join_completed(&self) {
        let mut free = self.free.lock().unwrap();
        free.retain_mut(|ft| {
            if ft.finished.load(Ordering::Acquire) {
                if let Some(handle) = ft.thread.take() {
                    let _ = handle.join();
                }
                false
            } else {
                true
            }
        });
    }

    fn join_all_free(&self) {
        let mut free = self.free.lock().unwrap();
        for ft in free.iter_mut() {
            if let Some(handle) = ft.thread.take() {
                let _ = handle.join();
            }
        }
        free.clear();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_runs_on_parked_threads() {
        let pool = ThreadPool::new(2);
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let hits = hits.clone();
            pool.run(Box::new(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            }));
        }

        pool.join();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(pool.free.lock().unwrap().is_empty());
    }

    #[test]
    fn test_overflows_to_free_threads() {
        let pool = ThreadPool::new(1);
        let hits = Arc::new(AtomicUsize::new(0));

        // The first task occupies the only parked slot for a while, so the
        // rest must overflow.
        for _ in 0..4 {
            let hits = hits.clone();
            pool.run(Box::new(move || {
                thread::sleep(Duration::from_millis(50));
                hits.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert!(!pool.free.lock().unwrap().is_empty());

        pool.join();
        assert_eq!(hits.load(Ordering::SeqCst), 4);
        assert!(pool.free.lock().unwrap().is_empty());
    }

    #[test]
    fn test_reaps_completed_free_threads() {
        let pool = ThreadPool::new(1);

        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        pool.run(Box::new(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        }));
        started_rx.recv().unwrap();

        // Occupied slot: this one goes to a free thread and finishes fast.
        pool.run(Box::new(|| {}));
        assert_eq!(pool.free.lock().unwrap().len(), 1);

        thread::sleep(Duration::from_millis(50));

        // Another overflow triggers the reaping pass for the first one.
        pool.run(Box::new(|| {}));
        assert!(pool.free.lock().unwrap().len() <= 1);

        release_tx.send(()).unwrap();
        pool.join();
    }

    #[test]
    fn test_stop_and_join_is_idempotent() {
        let pool = ThreadPool::new(2);
        pool.run(Box::new(|| {}));
        pool.stop_and_join();
        pool.stop_and_join();
    }
}
