// Copyright 2026 The cosched Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Stackful coroutine handles

use std::any::Any;
use std::fmt;
use std::panic;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};
use context::stack::ProtectedFixedSizeStack;
use context::{Context, Transfer};

use crate::options::Options;

/// Owning handle to a coroutine.
///
/// Exactly one handle exists per live coroutine; it moves between ready
/// queues, channel wait lists and the processor currently running it.
pub type Handle = Box<Coroutine>;

/// State communicated to the processor when `resume` returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Yielded voluntarily; ready to run again.
    Suspended,
    /// Waiting on a channel; the park callback decides where the handle goes.
    Parked,
    /// The body returned; the handle must not be resumed again.
    Finished,
}

/// Diagnostic identity, shared between the handle and the scheduler's
/// live set so `debug_dump` can report on coroutines it does not own.
pub struct Meta {
    id: usize,
    name: String,
    checkpoint: Mutex<&'static str>,
    spawned_at: DateTime<Local>,
}

impl Meta {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn checkpoint(&self) -> &'static str {
        *self.checkpoint.lock().unwrap()
    }

    pub fn set_checkpoint(&self, checkpoint: &'static str) {
        *self.checkpoint.lock().unwrap() = checkpoint;
    }

    pub fn spawned_at(&self) -> DateTime<Local> {
        self.spawned_at
    }
}

pub struct Coroutine {
    meta: Arc<Meta>,
    state: State,
    // Where to jump to run the coroutine; None while it is running or
    // after it finished.
    context: Option<Context>,
    // Where an in-coroutine yield returns to; refreshed on every switch.
    parent: Option<Context>,
    func: Option<Box<dyn FnOnce() + Send + 'static>>,
    // Keeps the stack mapped for as long as `context` points into it.
    _stack: ProtectedFixedSizeStack,
}

unsafe impl Send for Coroutine {}

impl Coroutine {
    pub fn spawn(id: usize, f: Box<dyn FnOnce() + Send + 'static>, opts: Options) -> Handle {
        let stack = ProtectedFixedSizeStack::new(opts.stack_size)
            .expect("failed to allocate a coroutine stack");
        let context = unsafe { Context::new(&stack, coroutine_entry) };
        let name = opts.name.unwrap_or_else(|| format!("coroutine-{}", id));

        Box::new(Coroutine {
            meta: Arc::new(Meta {
                id,
                name,
                checkpoint: Mutex::new("spawned"),
                spawned_at: Local::now(),
            }),
            state: State::Suspended,
            context: Some(context),
            parent: None,
            func: Some(f),
            _stack: stack,
        })
    }

    pub fn id(&self) -> usize {
        self.meta.id
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn meta(&self) -> &Arc<Meta> {
        &self.meta
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn set_checkpoint(&self, checkpoint: &'static str) {
        self.meta.set_checkpoint(checkpoint);
    }

    /// Transfers control to the coroutine; returns once it yields or
    /// finishes. Must be called from the processor's own context.
    pub fn resume(&mut self) -> State {
        let context = self.context.take().expect("resumed a finished coroutine");
        let transfer = unsafe { context.resume(self as *mut Coroutine as usize) };
        if self.state != State::Finished {
            self.context = Some(transfer.context);
        }
        self.state
    }

    /// Suspends back to the processor with the given state. Must be called
    /// on this coroutine's own stack.
    pub fn yield_with(&mut self, state: State, checkpoint: &'static str) {
        self.state = state;
        self.meta.set_checkpoint(checkpoint);

        let parent = self
            .parent
            .take()
            .expect("yield without a suspended processor context");
        let transfer = unsafe { parent.resume(0) };
        self.parent = Some(transfer.context);
    }
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Coroutine(#{}, '{}')", self.meta.id, self.meta.name)
    }
}

extern "C" fn coroutine_entry(t: Transfer) -> ! {
    let coro = unsafe { &mut *(t.data as *mut Coroutine) };
    coro.parent = Some(t.context);

    let f = coro.func.take().expect("coroutine spawned without a body");
    if let Err(cause) = panic::catch_unwind(panic::AssertUnwindSafe(f)) {
        // A fault in one coroutine must not take the scheduler down.
        error!("coroutine '{}' panicked: {}", coro.name(), payload_message(&*cause));
    }

    coro.state = State::Finished;
    coro.meta.set_checkpoint("finished");

    let parent = coro
        .parent
        .take()
        .expect("finished coroutine without a processor context");
    unsafe { parent.resume(0) };
    unreachable!("a finished coroutine was resumed");
}

fn payload_message(cause: &(dyn Any + Send)) -> &str {
    if let Some(s) = cause.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = cause.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}
