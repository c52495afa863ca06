//! Epollable queue throughput and latency benchmark.
//!
//! The consumer side is a mio reactor that sleeps in `epoll_wait` and drains
//! on wakeup, which is the pattern the queue exists for.
//!
//! Usage:
//!     cargo run --release --bin queue_bench
//!
//! Environment variables:
//!     PRODUCER_CPU=0  Pin producer to CPU 0 (default: 0)
//!     CONSUMER_CPU=2  Pin consumer to CPU 2 (default: 2)

use std::env;
use std::sync::Arc;
use std::thread;

use minstant::Instant;
use mio::{Events, Interest, Poll, Token};

use epollq::{EpollableBoundedQueue, Push};

const QUEUE_SIZE: usize = 4096;
const ITERATIONS: usize = 1 << 20;
const RTT_ITERATIONS: usize = 1 << 16;

const QUEUE: Token = Token(0);

type Payload = u64;
type Queue = EpollableBoundedQueue<Payload>;

fn get_cpu_affinity() -> (Option<usize>, Option<usize>) {
    let producer_cpu = env::var("PRODUCER_CPU")
        .ok()
        .and_then(|s| s.parse().ok())
        .or(Some(0));
    let consumer_cpu = env::var("CONSUMER_CPU")
        .ok()
        .and_then(|s| s.parse().ok())
        .or(Some(2));
    (producer_cpu, consumer_cpu)
}

fn pin_to_cpu(cpu: Option<usize>) {
    if let Some(id) = cpu {
        core_affinity::set_for_current(core_affinity::CoreId { id });
    }
}

fn push_spin(queue: &Queue, mut value: Payload) {
    loop {
        match queue.push_back(value).unwrap() {
            Push::Accepted => return,
            Push::Full(back) => value = back,
        }
        std::hint::spin_loop();
    }
}

/// Blocks in `poll` until the queue yields one element.
struct Waiter {
    poll: Poll,
    events: Events,
}

impl Waiter {
    fn new(queue: &Queue) -> Self {
        let poll = Poll::new().unwrap();
        poll.registry()
            .register(&mut &*queue, QUEUE, Interest::READABLE)
            .unwrap();
        Self {
            poll,
            events: Events::with_capacity(4),
        }
    }

    fn recv(&mut self, queue: &Queue) -> Payload {
        loop {
            if let Some(value) = queue.pop_front().unwrap() {
                return value;
            }
            self.poll.poll(&mut self.events, None).unwrap();
        }
    }
}

fn bench_throughput(producer_cpu: Option<usize>, consumer_cpu: Option<usize>) {
    let queue = Arc::new(Queue::new(QUEUE_SIZE).unwrap());
    let mut waiter = Waiter::new(&queue);

    let consumer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            pin_to_cpu(consumer_cpu);
            for expected in 0..ITERATIONS as Payload {
                let value = waiter.recv(&queue);
                assert_eq!(value, expected, "data corruption");
            }
        })
    };

    pin_to_cpu(producer_cpu);
    let start = Instant::now();

    for i in 0..ITERATIONS as Payload {
        push_spin(&queue, i);
    }

    consumer.join().unwrap();
    let elapsed = start.elapsed();

    let ops_per_ms = ITERATIONS as u128 * 1_000_000 / elapsed.as_nanos().max(1);
    println!("{ops_per_ms} ops/ms");
}

fn bench_rtt(producer_cpu: Option<usize>, consumer_cpu: Option<usize>) {
    let ping = Arc::new(Queue::new(QUEUE_SIZE).unwrap());
    let pong = Arc::new(Queue::new(QUEUE_SIZE).unwrap());
    let mut ping_waiter = Waiter::new(&ping);
    let mut pong_waiter = Waiter::new(&pong);

    let responder = {
        let ping = Arc::clone(&ping);
        let pong = Arc::clone(&pong);
        thread::spawn(move || {
            pin_to_cpu(consumer_cpu);
            for _ in 0..RTT_ITERATIONS {
                let value = ping_waiter.recv(&ping);
                push_spin(&pong, value);
            }
        })
    };

    pin_to_cpu(producer_cpu);
    let start = Instant::now();

    for i in 0..RTT_ITERATIONS as Payload {
        push_spin(&ping, i);
        let echoed = pong_waiter.recv(&pong);
        assert_eq!(echoed, i);
    }

    let elapsed = start.elapsed();
    responder.join().unwrap();

    let rtt_ns = elapsed.as_nanos() / RTT_ITERATIONS as u128;
    println!("{rtt_ns} ns RTT");
}

fn main() {
    epollq::init_tracing();
    let (producer_cpu, consumer_cpu) = get_cpu_affinity();

    println!("epollq (size={QUEUE_SIZE}, iters={ITERATIONS}, rtt iters={RTT_ITERATIONS}):");
    bench_throughput(producer_cpu, consumer_cpu);
    bench_rtt(producer_cpu, consumer_cpu);
}
