// Copyright 2026 The cosched Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Bounded synchronous channels
//!
//! A channel is a typed FIFO of fixed capacity, split into a move-only
//! [`Reader`] and [`Writer`] half. Coroutines that cannot complete a `get`
//! or `put` immediately are parked on the channel and woken through the
//! scheduler; plain OS threads block on a condition variable instead, so
//! the halves stay usable from outside the scheduler.

use std::collections::VecDeque;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::coroutine::Handle;
use crate::runtime::processor::Processor;
use crate::scheduler::SchedulerShared;

/// Error returned by `get` and `put` on a closed channel.
///
/// Consumers treat it as end-of-stream, producers as "consumer gone".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelClosed;

impl fmt::Display for ChannelClosed {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "channel closed")
    }
}

impl Error for ChannelClosed {}

/// Error returned by the non-suspending [`Reader::try_get`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TryGetError {
    /// Nothing buffered right now.
    Empty,
    /// Closed and drained; no value will ever arrive.
    Closed,
}

impl fmt::Display for TryGetError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            TryGetError::Empty => write!(f, "channel empty"),
            TryGetError::Closed => write!(f, "channel closed"),
        }
    }
}

impl Error for TryGetError {}

// Circular buffer of capacity+1 slots; one sentinel slot keeps full and
// empty distinguishable.
struct Buffer<T> {
    slots: Box<[Option<T>]>,
    rd: usize,
    wr: usize,
}

impl<T> Buffer<T> {
    fn with_capacity(capacity: usize) -> Buffer<T> {
        let slots = (0..capacity + 1).map(|_| None).collect::<Vec<_>>();
        Buffer {
            slots: slots.into_boxed_slice(),
            rd: 0,
            wr: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.rd == self.wr
    }

    fn is_full(&self) -> bool {
        (self.wr + 1) % self.slots.len() == self.rd
    }

    fn push(&mut self, v: T) {
        debug_assert!(!self.is_full());
        self.slots[self.wr] = Some(v);
        self.wr = (self.wr + 1) % self.slots.len();
    }

    fn pop(&mut self) -> T {
        debug_assert!(!self.is_empty());
        let v = self.slots[self.rd].take().expect("occupied slot was empty");
        self.rd = (self.rd + 1) % self.slots.len();
        v
    }
}

struct ChannelState<T> {
    buffer: Buffer<T>,
    closed: bool,
    parked_readers: VecDeque<Handle>,
    parked_writers: VecDeque<Handle>,
}

struct ChannelCore<T> {
    // Valid for the owning scheduler's lifetime; only dereferenced to wake
    // parked coroutines, and none exist once the scheduler has drained.
    sched: *const SchedulerShared,
    state: Mutex<ChannelState<T>>,
    readable: Condvar,
    writable: Condvar,
}

unsafe impl<T: Send> Send for ChannelCore<T> {}
unsafe impl<T: Send> Sync for ChannelCore<T> {}

impl<T> ChannelCore<T> {
    fn sched(&self) -> &SchedulerShared {
        unsafe { &*self.sched }
    }

    fn put(&self, v: T) -> Result<(), ChannelClosed> {
        let mut pending = Some(v);
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if state.closed {
                    return Err(ChannelClosed);
                }
                if !state.buffer.is_full() {
                    let v = pending.take().expect("value already consumed");
                    state.buffer.push(v);
                    self.wake_one_reader(state);
                    return Ok(());
                }
            }
            self.wait_writable();
        }
    }

    fn get(&self) -> Result<T, ChannelClosed> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if !state.buffer.is_empty() {
                    let v = state.buffer.pop();
                    self.wake_one_writer(state);
                    return Ok(v);
                }
                if state.closed {
                    return Err(ChannelClosed);
                }
            }
            self.wait_readable();
        }
    }

    fn try_get(&self) -> Result<T, TryGetError> {
        let mut state = self.state.lock().unwrap();
        if !state.buffer.is_empty() {
            let v = state.buffer.pop();
            self.wake_one_writer(state);
            Ok(v)
        } else if state.closed {
            Err(TryGetError::Closed)
        } else {
            Err(TryGetError::Empty)
        }
    }

    fn close(&self) {
        let woken = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            let mut woken: Vec<Handle> = state.parked_readers.drain(..).collect();
            woken.extend(state.parked_writers.drain(..));
            woken
        };

        self.readable.notify_all();
        self.writable.notify_all();
        if !woken.is_empty() {
            self.sched().schedule(woken);
        }
    }

    // One waiter per opening transition; parked coroutines come first,
    // plain-thread waiters otherwise.
    fn wake_one_reader(&self, mut state: MutexGuard<ChannelState<T>>) {
        if let Some(coro) = state.parked_readers.pop_front() {
            drop(state);
            self.sched().schedule(vec![coro]);
        } else {
            drop(state);
            self.readable.notify_one();
        }
    }

    fn wake_one_writer(&self, mut state: MutexGuard<ChannelState<T>>) {
        if let Some(coro) = state.parked_writers.pop_front() {
            drop(state);
            self.sched().schedule(vec![coro]);
        } else {
            drop(state);
            self.writable.notify_one();
        }
    }

    fn wait_writable(&self) {
        if let Some(p) = Processor::current() {
            p.park_with("channel put: full", |p, coro| {
                let mut state = self.state.lock().unwrap();
                if state.closed || !state.buffer.is_full() {
                    // A slot opened while we were switching stacks.
                    p.ready(coro);
                } else {
                    state.parked_writers.push_back(coro);
                }
            });
        } else {
            let mut state = self.state.lock().unwrap();
            while state.buffer.is_full() && !state.closed {
                state = self.writable.wait(state).unwrap();
            }
        }
    }

    fn wait_readable(&self) {
        if let Some(p) = Processor::current() {
            p.park_with("channel get: empty", |p, coro| {
                let mut state = self.state.lock().unwrap();
                if state.closed || !state.buffer.is_empty() {
                    p.ready(coro);
                } else {
                    state.parked_readers.push_back(coro);
                }
            });
        } else {
            let mut state = self.state.lock().unwrap();
            while state.buffer.is_empty() && !state.closed {
                state = self.readable.wait(state).unwrap();
            }
        }
    }
}

/// Receiving half of a channel. Move-only; dropping it closes the channel.
pub struct Reader<T> {
    core: Arc<ChannelCore<T>>,
}

unsafe impl<T: Send> Send for Reader<T> {}

impl<T> Reader<T> {
    /// Takes the next value, suspending the calling coroutine while the
    /// channel is empty. Fails once the channel is closed and drained.
    pub fn get(&self) -> Result<T, ChannelClosed> {
        self.core.get()
    }

    /// Non-suspending variant of `get`.
    pub fn try_get(&self) -> Result<T, TryGetError> {
        self.core.try_get()
    }

    /// Closes the channel and wakes every parked waiter. Idempotent.
    pub fn close(&self) {
        self.core.close();
    }
}

impl<T> Drop for Reader<T> {
    fn drop(&mut self) {
        self.core.close();
    }
}

/// Sending half of a channel. Move-only; dropping it closes the channel.
pub struct Writer<T> {
    core: Arc<ChannelCore<T>>,
}

unsafe impl<T: Send> Send for Writer<T> {}

impl<T> Writer<T> {
    /// Moves `v` into the channel, suspending the calling coroutine while
    /// the buffer is full. Fails once the channel is closed.
    pub fn put(&self, v: T) -> Result<(), ChannelClosed> {
        self.core.put(v)
    }

    /// Closes the channel and wakes every parked waiter. Idempotent.
    pub fn close(&self) {
        self.core.close();
    }
}

impl<T> Drop for Writer<T> {
    fn drop(&mut self) {
        self.core.close();
    }
}

/// Creates a channel pair on the given scheduler.
pub(crate) fn make<T: Send>(
    sched: *const SchedulerShared,
    capacity: usize,
) -> (Reader<T>, Writer<T>) {
    assert!(capacity >= 1, "channel capacity must be at least 1");

    let core = Arc::new(ChannelCore {
        sched,
        state: Mutex::new(ChannelState {
            buffer: Buffer::with_capacity(capacity),
            closed: false,
            parked_readers: VecDeque::new(),
            parked_writers: VecDeque::new(),
        }),
        readable: Condvar::new(),
        writable: Condvar::new(),
    });

    (Reader { core: core.clone() }, Writer { core })
}

#[cfg(test)]
mod test {
    use std::ptr;
    use std::thread;
    use std::time::Duration;

    use super::*;

    // Channels used from plain threads never touch the scheduler, so the
    // tests below can run without one.
    fn plain_channel<T: Send>(capacity: usize) -> (Reader<T>, Writer<T>) {
        make(ptr::null(), capacity)
    }

    #[test]
    fn test_fifo_within_capacity() {
        let (rd, wr) = plain_channel::<u32>(4);

        for i in 0..4 {
            assert_eq!(wr.put(i), Ok(()));
        }
        for i in 0..4 {
            assert_eq!(rd.try_get(), Ok(i));
        }
        assert_eq!(rd.try_get(), Err(TryGetError::Empty));
    }

    #[test]
    fn test_try_get_never_suspends() {
        let (rd, wr) = plain_channel::<u32>(1);
        assert_eq!(rd.try_get(), Err(TryGetError::Empty));

        wr.put(9).unwrap();
        assert_eq!(rd.try_get(), Ok(9));

        wr.close();
        assert_eq!(rd.try_get(), Err(TryGetError::Closed));
    }

    #[test]
    fn test_close_is_idempotent() {
        let (rd, wr) = plain_channel::<u32>(2);
        wr.put(1).unwrap();
        wr.close();
        wr.close();
        rd.close();

        // The buffered value survives the close; only the drained channel
        // reports closure.
        assert_eq!(rd.get(), Ok(1));
        assert_eq!(rd.get(), Err(ChannelClosed));
        assert_eq!(wr.put(2), Err(ChannelClosed));
    }

    #[test]
    fn test_drop_closes() {
        let (rd, wr) = plain_channel::<u32>(1);
        drop(wr);
        assert_eq!(rd.get(), Err(ChannelClosed));

        let (rd, wr) = plain_channel::<u32>(1);
        drop(rd);
        assert_eq!(wr.put(1), Err(ChannelClosed));
    }

    #[test]
    fn test_full_put_blocks_plain_thread() {
        let (rd, wr) = plain_channel::<u32>(2);

        let producer = thread::spawn(move || {
            for i in 0..5 {
                wr.put(i).unwrap();
            }
        });

        // Give the producer time to fill the buffer and block on the third
        // value, then drain slowly and check nothing is lost or reordered.
        thread::sleep(Duration::from_millis(50));
        for i in 0..5 {
            assert_eq!(rd.get(), Ok(i));
        }
        producer.join().unwrap();
    }

    #[test]
    fn test_empty_get_blocks_plain_thread() {
        let (rd, wr) = plain_channel::<u32>(1);

        let consumer = thread::spawn(move || {
            assert_eq!(rd.get(), Ok(42));
            assert_eq!(rd.get(), Err(ChannelClosed));
        });

        thread::sleep(Duration::from_millis(50));
        wr.put(42).unwrap();
        drop(wr);
        consumer.join().unwrap();
    }

    #[test]
    fn test_leftover_values_are_dropped() {
        let value = std::sync::Arc::new(());
        let (rd, wr) = plain_channel::<std::sync::Arc<()>>(4);
        wr.put(value.clone()).unwrap();
        wr.put(value.clone()).unwrap();

        drop(wr);
        drop(rd);
        assert_eq!(std::sync::Arc::strong_count(&value), 1);
    }
}
