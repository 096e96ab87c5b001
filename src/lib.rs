// Copyright 2026 The cosched Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! M:N coroutine scheduling with bounded synchronous channels
//!
//! A [`Scheduler`] multiplexes lightweight stackful coroutines over a small
//! set of OS threads ("processors"). Coroutines communicate over bounded
//! channels, suspend cooperatively when a channel operation cannot complete,
//! and escape into plain blocking code through [`block`], which grows the
//! processor set so the rest of the system keeps running.
//!
//! ```no_run
//! use cosched::Scheduler;
//!
//! let sched = Scheduler::new(2);
//! let (rx, tx) = sched.make_channel::<u32>(4);
//!
//! sched.go("producer", move || {
//!     for i in 0..10 {
//!         tx.put(i).unwrap();
//!     }
//! });
//! sched.go("consumer", move || {
//!     while let Ok(v) = rx.get() {
//!         println!("got {}", v);
//!     }
//! });
//!
//! sched.wait();
//! ```

#[macro_use]
extern crate log;

pub mod options;
pub mod scheduler;
pub mod sync;

mod coroutine;
mod runtime;

pub use crate::options::Options;
pub use crate::scheduler::Scheduler;
pub use crate::sync::channel::{ChannelClosed, Reader, TryGetError, Writer};

use crate::runtime::processor::Processor;
use crate::scheduler::SchedulerShared;

/// Spawns a named coroutine on the scheduler of the current processor.
///
/// Panics when the calling thread is not running a processor; spawn through
/// [`Scheduler::go`] from the outside.
pub fn go<F>(name: &str, f: F)
where
    F: FnOnce() + Send + 'static,
{
    match Processor::current() {
        Some(p) => p
            .scheduler()
            .go_opts(Box::new(f), Options::new().name(name.to_owned())),
        None => panic!("go() called with no current scheduler"),
    }
}

/// Spawns a coroutine with explicit options on the current scheduler.
pub fn go_opts<F>(f: F, opts: Options)
where
    F: FnOnce() + Send + 'static,
{
    match Processor::current() {
        Some(p) => p.scheduler().go_opts(Box::new(f), opts),
        None => panic!("go_opts() called with no current scheduler"),
    }
}

/// Creates a bounded channel on the scheduler of the current processor.
pub fn make_channel<T: Send>(capacity: usize) -> (Reader<T>, Writer<T>) {
    match Processor::current() {
        Some(p) => sync::channel::make(p.scheduler() as *const SchedulerShared, capacity),
        None => panic!("make_channel() called with no current scheduler"),
    }
}

/// Runs `f` on the current OS thread while the scheduler treats the
/// processor as blocked. Other coroutines keep making progress on a
/// replacement processor; ideal for long system calls.
pub fn block<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    match Processor::current() {
        Some(p) => p.run_blocking(f),
        None => panic!("block() called outside a processor"),
    }
}

/// Gives up the processor so other ready coroutines can run. A no-op
/// outside a coroutine.
pub fn yield_now() {
    if let Some(p) = Processor::current() {
        p.sched();
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
    fn test_free_functions_inside_coroutines() {
        let sched = Scheduler::new(2);
        let (rd, wr) = sched.make_channel::<usize>(4);
        let sum = Arc::new(AtomicUsize::new(0));

        {
            let sum = sum.clone();
            sched.go("root", move || {
                go("producer", move || {
                    for i in 0..10 {
                        wr.put(i).unwrap();
                        yield_now();
                    }
                });

                while let Ok(v) = rd.get() {
                    sum.fetch_add(v, Ordering::SeqCst);
                }
            });
        }

        sched.wait();
        assert_eq!(sum.load(Ordering::SeqCst), 45);
    }

    #[test]
    fn test_nested_channels_via_free_functions() {
        let sched = Scheduler::new(1);
        let result = Arc::new(AtomicUsize::new(0));

        {
            let result = result.clone();
            sched.go("root", move || {
                let (rd, wr) = make_channel::<usize>(1);
                go("inner", move || {
                    let slept = block(|| {
                        thread::sleep(Duration::from_millis(10));
                        21
                    });
                    wr.put(slept * 2).unwrap();
                });
                result.store(rd.get().unwrap(), Ordering::SeqCst);
            });
        }

        sched.wait();
        assert_eq!(result.load(Ordering::SeqCst), 42);
    }

    #[test]
    #[should_panic(expected = "outside a processor")]
    fn test_block_outside_a_processor_panics() {
        block(|| ());
    }

    #[test]
    #[should_panic(expected = "no current scheduler")]
    fn test_go_outside_a_processor_panics() {
        go("nowhere", || ());
    }

    #[test]
    #[should_panic(expected = "capacity must be at least 1")]
    fn test_zero_capacity_is_refused() {
        let sched = Scheduler::new(1);
        let _ = sched.make_channel::<u32>(0);
    }

    #[test]
    fn test_yield_outside_a_processor_is_a_noop() {
        yield_now();
    }
}
