// Copyright 2026 The cosched Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Processing unit of a thread

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::mem;
use std::sync::{Arc, Condvar, Mutex};

use crate::coroutine::{Coroutine, Handle, State};
use crate::scheduler::SchedulerShared;

thread_local!(static PROCESSOR: UnsafeCell<Option<Arc<Processor>>> = UnsafeCell::new(None));

/// Executor state as seen by the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcState {
    /// Executing a coroutine.
    Running,
    /// Queue drained; waiting for work or stop.
    Idle,
    /// The OS thread is tied up inside a `block` region.
    Blocked,
    /// Run loop is exiting.
    Stopping,
}

/// One execution slot: an OS thread with a local ready queue, running
/// coroutines cooperatively.
///
/// The queue is guarded by a mutex so the scheduler can feed it and other
/// processors can steal from it; everything in `Exec` is touched only by
/// the owning thread.
pub struct Processor {
    id: usize,
    sched: *const SchedulerShared,
    queue: Mutex<ReadyQueue>,
    wakeup: Condvar,
    exec: UnsafeCell<Exec>,
}

unsafe impl Send for Processor {}
unsafe impl Sync for Processor {}

struct ReadyQueue {
    ready: VecDeque<Handle>,
    state: ProcState,
}

struct Exec {
    current: Option<Handle>,
    park_cb: Option<&'static mut dyn FnMut(&Processor, Handle)>,
}

impl Processor {
    pub fn new(id: usize, sched: *const SchedulerShared) -> Arc<Processor> {
        Arc::new(Processor {
            id,
            sched,
            queue: Mutex::new(ReadyQueue {
                ready: VecDeque::new(),
                state: ProcState::Idle,
            }),
            wakeup: Condvar::new(),
            exec: UnsafeCell::new(Exec {
                current: None,
                park_cb: None,
            }),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn scheduler(&self) -> &SchedulerShared {
        unsafe { &*self.sched }
    }

    /// Hands the run loop to the scheduler's thread pool.
    pub fn start(self: &Arc<Processor>) {
        let me = self.clone();
        self.scheduler().pool().run(Box::new(move || me.main_loop()));
    }

    /// The processor bound to the calling thread, if any.
    pub fn current() -> Option<Arc<Processor>> {
        PROCESSOR.with(|p| unsafe { (*p.get()).clone() })
    }

    fn set_tls(p: Option<Arc<Processor>>) {
        PROCESSOR.with(|slot| unsafe {
            *slot.get() = p;
        })
    }

    // Owner-thread-only state; other threads must go through the queue
    // interface instead.
    #[allow(clippy::mut_from_ref)]
    fn exec(&self) -> &mut Exec {
        unsafe { &mut *self.exec.get() }
    }

    // --- queue interface, called by the scheduler and by stealers ---

    /// Pushes a batch of ready coroutines. Refused while the processor is
    /// blocked or stopping; the scheduler must then route the batch
    /// elsewhere.
    pub fn enqueue(&self, coros: Vec<Handle>) -> Result<(), Vec<Handle>> {
        let mut queue = self.queue.lock().unwrap();
        match queue.state {
            ProcState::Blocked | ProcState::Stopping => Err(coros),
            _ => {
                queue.ready.extend(coros);
                self.wakeup.notify_one();
                Ok(())
            }
        }
    }

    /// Like `enqueue`, for call sites where the scheduler has already
    /// decided this processor must accept.
    pub fn enqueue_or_die(&self, coros: Vec<Handle>) {
        if self.enqueue(coros).is_err() {
            panic!("processor {} refused a mandatory batch", self.id);
        }
    }

    /// Takes up to half of the local queue, from the end opposite the
    /// owner's. Best effort: an empty or single-entry queue yields nothing.
    pub fn steal(&self) -> Vec<Handle> {
        let mut queue = self.queue.lock().unwrap();
        let count = queue.ready.len() / 2;
        let at = queue.ready.len() - count;
        queue.ready.split_off(at).into_iter().collect()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap().ready.len()
    }

    /// Marks the processor stopping if it is idle with an empty queue.
    pub fn stop_if_idle(&self) -> bool {
        let mut queue = self.queue.lock().unwrap();
        if queue.state == ProcState::Idle && queue.ready.is_empty() {
            queue.state = ProcState::Stopping;
            self.wakeup.notify_one();
            true
        } else {
            false
        }
    }

    /// Unconditional stop, used at scheduler shutdown.
    pub fn stop(&self) {
        let mut queue = self.queue.lock().unwrap();
        queue.state = ProcState::Stopping;
        self.wakeup.notify_one();
    }

    // --- run loop, on the pool thread ---

    fn main_loop(self: Arc<Processor>) {
        Processor::set_tls(Some(self.clone()));
        debug!("processor {} up", self.id);

        'schedule: loop {
            let coro = {
                let mut queue = self.queue.lock().unwrap();
                if queue.state == ProcState::Stopping {
                    break 'schedule;
                }

                match queue.ready.pop_front() {
                    Some(coro) => {
                        queue.state = ProcState::Running;
                        coro
                    }
                    None => {
                        queue.state = ProcState::Idle;
                        drop(queue);

                        self.scheduler().processor_starved(&self);

                        let mut queue = self.queue.lock().unwrap();
                        while queue.ready.is_empty() && queue.state != ProcState::Stopping {
                            queue = self.wakeup.wait(queue).unwrap();
                        }
                        continue 'schedule;
                    }
                }
            };

            self.resume(coro);
        }

        // The scheduler only stops processors once wait() has seen the
        // live set drain, so the queue is empty here.
        Processor::set_tls(None);
        debug!("processor {} down", self.id);
    }

    fn resume(&self, coro: Handle) {
        trace!("processor {}: resuming {:?}", self.id, coro);
        self.exec().current = Some(coro);

        let state = {
            let coro: *mut Coroutine = {
                let exec = self.exec();
                &mut **exec.current.as_mut().expect("current coroutine vanished")
            };
            unsafe { (*coro).resume() }
        };
        let coro = self.exec().current.take().expect("current coroutine vanished");

        match state {
            State::Suspended => self.scheduler().schedule(vec![coro]),
            State::Parked => {
                let callback = self
                    .exec()
                    .park_cb
                    .take()
                    .expect("parked coroutine without a callback");
                callback(self, coro);
            }
            State::Finished => {
                trace!("processor {}: {:?} finished", self.id, coro);
                self.scheduler().coroutine_finished(coro);
            }
        }
    }

    // --- called from the coroutine currently running on this processor ---

    /// Gives up the processor; the coroutine goes back through the
    /// scheduler's placement policy.
    pub fn sched(&self) {
        self.yield_with(State::Suspended, "yielded");
    }

    /// Parks the running coroutine. `callback` runs on the processor's main
    /// context with the coroutine's handle after the stack switch; it must
    /// either stash the handle on a wait list or hand it back via `ready`,
    /// and call nothing else on the scheduler.
    pub fn park_with<F>(&self, checkpoint: &'static str, callback: F)
    where
        F: FnOnce(&Processor, Handle),
    {
        let mut callback = Some(callback);
        let mut wrapper = move |p: &Processor, coro: Handle| {
            (callback.take().expect("park callback invoked twice"))(p, coro)
        };

        {
            // Erase the callback's lifetime: it is invoked before this
            // frame resumes, while the closure is still alive on this stack.
            let cb: &mut dyn FnMut(&Processor, Handle) = &mut wrapper;
            let cb: &'static mut dyn FnMut(&Processor, Handle) = unsafe { mem::transmute(cb) };
            self.exec().park_cb = Some(cb);
        }
        self.yield_with(State::Parked, checkpoint);
    }

    /// Re-queues a coroutine on this processor, bypassing the scheduler.
    /// Only for park callbacks whose wait condition resolved while the
    /// stack switch was in flight.
    pub fn ready(&self, coro: Handle) {
        self.queue.lock().unwrap().ready.push_back(coro);
    }

    /// Runs `f` to completion on this OS thread while the scheduler treats
    /// the processor as blocked; remaining ready work is redistributed
    /// first so it is not stranded here.
    pub fn run_blocking<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        {
            let exec = self.exec();
            let coro = exec.current.as_mut().expect("block() outside a coroutine");
            coro.set_checkpoint("blocked");
        }

        let drained: Vec<Handle> = {
            let mut queue = self.queue.lock().unwrap();
            queue.state = ProcState::Blocked;
            queue.ready.drain(..).collect()
        };
        self.scheduler().processor_blocked(self, drained);

        // Restores the running state even if `f` panics; the panic itself
        // is contained by the coroutine entry wrapper.
        struct Unblock<'a>(&'a Processor);
        impl<'a> Drop for Unblock<'a> {
            fn drop(&mut self) {
                {
                    let mut queue = self.0.queue.lock().unwrap();
                    queue.state = ProcState::Running;
                }
                self.0.scheduler().processor_unblocked(self.0);
            }
        }

        let _unblock = Unblock(self);
        f()
    }

    fn yield_with(&self, state: State, checkpoint: &'static str) {
        let coro: *mut Coroutine = {
            let exec = self.exec();
            &mut **exec
                .current
                .as_mut()
                .expect("yield without a running coroutine")
        };
        unsafe { (*coro).yield_with(state, checkpoint) };
    }
}

#[cfg(test)]
mod test {
    use std::ptr;

    use super::*;
    use crate::coroutine::Coroutine;
    use crate::options::Options;

    fn dummy_coro(id: usize) -> Handle {
        Coroutine::spawn(id, Box::new(|| {}), Options::new())
    }

    #[test]
    fn test_steal_takes_the_tail_half() {
        let p = Processor::new(0, ptr::null());
        p.enqueue((0..5).map(dummy_coro).collect()).ok().unwrap();

        let stolen = p.steal();
        assert_eq!(stolen.len(), 2);
        assert_eq!(p.queue_len(), 3);

        // The owner keeps the front of the queue.
        let ids: Vec<usize> = stolen.iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec![3, 4]);
    }

    #[test]
    fn test_steal_leaves_single_entry_queues_alone() {
        let p = Processor::new(0, ptr::null());
        assert!(p.steal().is_empty());

        p.enqueue(vec![dummy_coro(0)]).ok().unwrap();
        assert!(p.steal().is_empty());
        assert_eq!(p.queue_len(), 1);
    }

    #[test]
    fn test_enqueue_refused_when_stopping() {
        let p = Processor::new(0, ptr::null());
        assert!(p.stop_if_idle());
        assert!(p.enqueue(vec![dummy_coro(0)]).is_err());
    }

    #[test]
    fn test_stop_if_idle_refuses_pending_work() {
        let p = Processor::new(0, ptr::null());
        p.enqueue(vec![dummy_coro(0)]).ok().unwrap();
        assert!(!p.stop_if_idle());
    }
}
