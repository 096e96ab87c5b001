// Copyright 2026 The cosched Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Coroutine scheduler
//!
//! Owns the processor set and decides where ready coroutines run. New and
//! woken coroutines go to a starved processor first, then to the current
//! processor's queue, then to the global overflow queue. Starving
//! processors are fed from the global queue or by stealing from the most
//! loaded active processor. Blocking regions grow the processor set so
//! that `active_processors` runnable OS threads remain; unblocking shrinks
//! it back once it exceeds the high-water mark.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::coroutine::{Coroutine, Handle, Meta};
use crate::options::Options;
use crate::runtime::processor::Processor;
use crate::runtime::thread_pool::ThreadPool;
use crate::sync::channel::{self, Reader, Writer};

/// Owner handle for a running scheduler.
///
/// Dropping it waits for every live coroutine to finish and then stops the
/// processors, so a scheduler must be torn down from outside its own
/// coroutines.
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
}

impl Scheduler {
    /// Starts a scheduler with the given number of active processors.
    pub fn new(active_processors: usize) -> Scheduler {
        assert!(active_processors >= 1, "scheduler needs at least one active processor");

        let shared = Arc::new(SchedulerShared {
            active_processors,
            pool: ThreadPool::new(active_processors * 2),
            processors: RwLock::new(ProcessorSet {
                procs: Vec::new(),
                blocked: 0,
            }),
            coroutines: Mutex::new(Registry {
                live: HashMap::new(),
                max_live_seen: 0,
            }),
            all_done: Condvar::new(),
            starved: Mutex::new(Vec::new()),
            global_queue: Mutex::new(Vec::new()),
            rng: Mutex::new(SmallRng::from_entropy()),
            next_coro_id: AtomicUsize::new(1),
            next_proc_id: AtomicUsize::new(0),
        });

        let initial: Vec<Arc<Processor>> = {
            let mut set = shared.processors.write().unwrap();
            for _ in 0..active_processors {
                let p = shared.new_processor();
                set.procs.push(p);
            }
            set.procs.clone()
        };
        for p in &initial {
            p.start();
        }

        Scheduler { shared }
    }

    /// Spawns a named coroutine.
    pub fn go<F>(&self, name: &str, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared
            .go_opts(Box::new(f), Options::new().name(name.to_owned()));
    }

    /// Spawns a coroutine with explicit options.
    pub fn go_opts<F>(&self, f: F, opts: Options)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.go_opts(Box::new(f), opts);
    }

    /// Creates a bounded channel owned by this scheduler.
    pub fn make_channel<T: Send>(&self, capacity: usize) -> (Reader<T>, Writer<T>) {
        channel::make(Arc::as_ptr(&self.shared), capacity)
    }

    /// Blocks the calling thread until every live coroutine has finished.
    pub fn wait(&self) {
        self.shared.wait();
    }

    /// Prints a diagnostic snapshot to stderr and terminates the process.
    /// A last resort for debugging stuck pipelines.
    pub fn debug_dump(&self) -> ! {
        self.shared.debug_dump()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shared.wait();
        self.shared.stop_all();
    }
}

pub(crate) struct SchedulerShared {
    active_processors: usize,
    pool: ThreadPool,
    // Lock order, top to bottom: processors, coroutines, starved,
    // global_queue. A processor's queue mutex sits below all of these.
    processors: RwLock<ProcessorSet>,
    coroutines: Mutex<Registry>,
    all_done: Condvar,
    starved: Mutex<Vec<Arc<Processor>>>,
    global_queue: Mutex<Vec<Handle>>,
    rng: Mutex<SmallRng>,
    next_coro_id: AtomicUsize,
    next_proc_id: AtomicUsize,
}

struct ProcessorSet {
    procs: Vec<Arc<Processor>>,
    blocked: usize,
}

struct Registry {
    live: HashMap<usize, Arc<Meta>>,
    max_live_seen: usize,
}

impl SchedulerShared {
    pub(crate) fn pool(&self) -> &ThreadPool {
        &self.pool
    }

    fn new_processor(&self) -> Arc<Processor> {
        let id = self.next_proc_id.fetch_add(1, Ordering::Relaxed);
        Processor::new(id, self as *const SchedulerShared)
    }

    pub(crate) fn go_opts(&self, f: Box<dyn FnOnce() + Send + 'static>, opts: Options) {
        let id = self.next_coro_id.fetch_add(1, Ordering::Relaxed);
        let coro = Coroutine::spawn(id, f, opts);
        debug!("sched: go '{}'", coro.name());

        {
            let mut registry = self.coroutines.lock().unwrap();
            registry.live.insert(id, coro.meta().clone());
            registry.max_live_seen = registry.max_live_seen.max(registry.live.len());
        }

        self.schedule(vec![coro]);
    }

    /// Routes newly-ready coroutines: a starved processor first, then the
    /// current processor, then the global overflow queue.
    pub(crate) fn schedule(&self, mut coros: Vec<Handle>) {
        if coros.is_empty() {
            return;
        }

        {
            // Holding the starved lock across the enqueue keeps the target
            // from being reaped underneath us: stop_if_idle only runs with
            // this lock held.
            let mut starved = self.starved.lock().unwrap();
            if let Some(p) = starved.pop() {
                trace!("sched: {} coroutines to starved processor {}", coros.len(), p.id());
                p.enqueue_or_die(coros);
                return;
            }
        }

        if let Some(p) = Processor::current() {
            match p.enqueue(coros) {
                Ok(()) => {
                    trace!("sched: coroutines queued on the current processor {}", p.id());
                    return;
                }
                Err(back) => coros = back,
            }
        }

        trace!("sched: {} coroutines to the global queue", coros.len());
        self.global_queue.lock().unwrap().extend(coros);
    }

    /// A processor drained its queue. Feed it or record it starved; either
    /// way the processor then sleeps on its own condvar until work or a
    /// stop arrives.
    pub(crate) fn processor_starved(&self, p: &Arc<Processor>) {
        trace!("sched: processor {} starved", p.id());

        // Step 1: drain the global queue into it.
        {
            let mut global = self.global_queue.lock().unwrap();
            if !global.is_empty() {
                let batch: Vec<Handle> = global.drain(..).collect();
                debug!("sched: feeding processor {} with {} global coroutines", p.id(), batch.len());
                if let Err(back) = p.enqueue(batch) {
                    // Reaped in the meantime; leave the work for others.
                    global.extend(back);
                }
                return;
            }
        }

        // Step 2: steal from the most loaded active processor.
        {
            let set = self.processors.read().unwrap();
            match set.procs.iter().position(|q| Arc::ptr_eq(q, p)) {
                Some(index) if index < self.active_processors + set.blocked => {
                    if let Some(victim) = self.most_busy(&set) {
                        let stolen = victim.steal();
                        if !stolen.is_empty() {
                            debug!(
                                "sched: processor {} stole {} coroutines from processor {}",
                                p.id(),
                                stolen.len(),
                                victim.id()
                            );
                            p.enqueue_or_die(stolen);
                            return;
                        }
                    }
                }
                // Outside the active window (or already removed): a shrink
                // candidate. Keep it off the starved list so it can be
                // reaped.
                _ => return,
            }
        }

        // Step 3: record as starved, then re-check the global queue. A
        // schedule() racing between step 1 and the insert would otherwise
        // strand its batch until the next starvation.
        let mut starved = self.starved.lock().unwrap();
        starved.push(p.clone());

        let batch: Vec<Handle> = {
            let mut global = self.global_queue.lock().unwrap();
            if global.is_empty() {
                return;
            }
            global.drain(..).collect()
        };
        starved.retain(|q| !Arc::ptr_eq(q, p));
        p.enqueue_or_die(batch);
    }

    // Most loaded processor in the active slice; ties broken by the PRNG.
    fn most_busy(&self, set: &ProcessorSet) -> Option<Arc<Processor>> {
        let active = &set.procs[..self.active_processors.min(set.procs.len())];
        let lengths: Vec<usize> = active.iter().map(|p| p.queue_len()).collect();

        let best = *lengths.iter().max()?;
        if best == 0 {
            return None;
        }

        let candidates: Vec<usize> = lengths
            .iter()
            .enumerate()
            .filter(|&(_, len)| *len == best)
            .map(|(i, _)| i)
            .collect();
        let pick = candidates[self.rng.lock().unwrap().gen_range(0..candidates.len())];
        Some(active[pick].clone())
    }

    /// A processor entered a blocking region: keep `active_processors`
    /// runnable OS threads by spawning a replacement, and reroute the
    /// blocked processor's remaining queue.
    pub(crate) fn processor_blocked(&self, p: &Processor, drained: Vec<Handle>) {
        let replacement = {
            let mut set = self.processors.write().unwrap();
            set.blocked += 1;
            debug!("sched: processor {} blocked ({} total)", p.id(), set.blocked);

            if set.procs.len() < self.active_processors + set.blocked {
                let np = self.new_processor();
                set.procs.push(np.clone());
                Some(np)
            } else {
                None
            }
        };

        if let Some(np) = replacement {
            debug!("sched: spawned replacement processor {}", np.id());
            np.start();
        }

        self.schedule(drained);
    }

    /// A blocking region finished; shrink the pool once it exceeds the
    /// high-water mark, down to twice the active count.
    pub(crate) fn processor_unblocked(&self, p: &Processor) {
        let mut set = self.processors.write().unwrap();
        assert!(set.blocked > 0, "unblock without a matching block");
        set.blocked -= 1;
        debug!("sched: processor {} unblocked ({} left)", p.id(), set.blocked);

        if set.procs.len() > self.active_processors * 3 + set.blocked {
            let mut starved = self.starved.lock().unwrap();
            while set.procs.len() > self.active_processors * 2 + set.blocked {
                let tail = set.procs.last().expect("empty processor set").clone();
                if tail.stop_if_idle() {
                    debug!("sched: reaping idle processor {}", tail.id());
                    starved.retain(|q| !Arc::ptr_eq(q, &tail));
                    set.procs.pop();
                } else {
                    // Busy tail; the next unblock will retry.
                    break;
                }
            }
        }
    }

    pub(crate) fn coroutine_finished(&self, coro: Handle) {
        debug!("sched: '{}' finished", coro.name());
        let mut registry = self.coroutines.lock().unwrap();
        registry.live.remove(&coro.id());
        if registry.live.is_empty() {
            self.all_done.notify_all();
        }
    }

    pub(crate) fn wait(&self) {
        let mut registry = self.coroutines.lock().unwrap();
        while !registry.live.is_empty() {
            registry = self.all_done.wait(registry).unwrap();
        }
    }

    pub(crate) fn debug_dump(&self) -> ! {
        let set = self.processors.read().unwrap();
        let registry = self.coroutines.lock().unwrap();

        eprintln!("=========== scheduler debug dump ============");
        eprintln!("       live coroutines now: {}", registry.live.len());
        eprintln!("  max live coroutines seen: {}", registry.max_live_seen);
        eprintln!("          no of processors: {}", set.procs.len());
        eprintln!("  no of blocked processors: {}", set.blocked);
        eprintln!(" live coroutines:");
        for meta in registry.live.values() {
            eprintln!(
                " * {} : {} (spawned {})",
                meta.name(),
                meta.checkpoint(),
                meta.spawned_at().format("%H:%M:%S%.3f")
            );
        }
        eprintln!("=============================================");
        std::process::abort();
    }

    fn stop_all(&self) {
        let stopped: Vec<Arc<Processor>> = {
            let mut set = self.processors.write().unwrap();
            self.starved.lock().unwrap().clear();
            set.procs.drain(..).collect()
        };
        for p in &stopped {
            p.stop();
        }
        self.pool.stop_and_join();
    }
}
