// Copyright 2026 The cosched Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Token ring: `nodes` coroutines connected by bounded channels pass an
//! incrementing counter around the ring `laps` times.
//!
//!     cargo run --example ring -- <nodes> <laps>

use std::time::Instant;

use cosched::{Scheduler, Writer};

fn create_node(sched: &Scheduler, id: usize, next: Writer<usize>) -> Writer<usize> {
    let (rx, tx) = sched.make_channel::<usize>(1);
    sched.go(&format!("node-{}", id), move || {
        loop {
            match rx.get() {
                Ok(0) | Err(_) => break,
                Ok(i) => {
                    if next.put(i + 1).is_err() {
                        break;
                    }
                }
            }
        }
        let _ = next.put(0);
    });
    tx
}

fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let nodes: usize = args
        .next()
        .map(|a| a.parse().expect("nodes must be a number"))
        .unwrap_or(1_000);
    let laps: usize = args
        .next()
        .map(|a| a.parse().expect("laps must be a number"))
        .unwrap_or(100);
    assert!(nodes >= 2, "a ring needs at least two nodes");

    let sched = Scheduler::new(num_cpus::get());

    let t0 = Instant::now();
    let (recv, mut send) = sched.make_channel::<usize>(1);
    for id in 0..nodes - 1 {
        send = create_node(&sched, id, send);
    }
    let t1 = Instant::now();
    println!("ring of {} nodes created", nodes);

    let mut hops = 0;
    for _ in 0..laps {
        send.put(hops + 1).unwrap();
        hops = recv.get().unwrap();
    }
    let t2 = Instant::now();
    println!("{} hops counted", hops);

    send.put(0).unwrap();
    recv.get().unwrap();
    drop(send);
    drop(recv);
    sched.wait();

    println!("creation time:  {:?}", t1.duration_since(t0));
    println!("messaging time: {:?}", t2.duration_since(t1));
}
