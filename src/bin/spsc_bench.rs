//! SPSC channel throughput and latency benchmark.
//!
//! Usage:
//!     cargo run --release --bin spsc_bench
//!
//! Environment variables:
//!     PRODUCER_CPU=0  Pin producer to CPU 0 (default: 0)
//!     CONSUMER_CPU=2  Pin consumer to CPU 2 (default: 2)

use std::env;

use minstant::Instant;

use strait::channel;

const CAPACITY: u32 = 1 << 16;
const ITERATIONS: usize = 1 << 22;

type Payload = i32;

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

fn bench_throughput(producer_cpu: Option<usize>, consumer_cpu: Option<usize>) {
    let (tx, rx) = channel::<Payload>(CAPACITY).unwrap();

    let consumer_thread = std::thread::spawn(move || {
        pin_to_cpu(consumer_cpu);

        for expected in 0..ITERATIONS as Payload {
            let value = rx.recv().expect("producer still sending");
            if value != expected {
                panic!("Data corruption: expected {}, got {}", expected, value);
            }
        }
    });

    pin_to_cpu(producer_cpu);

    let start = Instant::now();

    for i in 0..ITERATIONS as Payload {
        tx.send(i).expect("consumer is alive");
    }

    consumer_thread.join().unwrap();
    let elapsed = start.elapsed();

    let ops_per_ms = ITERATIONS as u128 * 1_000_000 / elapsed.as_nanos();
    println!("{} ops/ms", ops_per_ms);
}

fn bench_rtt(producer_cpu: Option<usize>, consumer_cpu: Option<usize>) {
    let (ping_tx, ping_rx) = channel::<Payload>(CAPACITY).unwrap();
    let (pong_tx, pong_rx) = channel::<Payload>(CAPACITY).unwrap();

    let responder = std::thread::spawn(move || {
        pin_to_cpu(consumer_cpu);

        for _ in 0..ITERATIONS {
            let value = ping_rx.recv().expect("pinger still sending");
            pong_tx.send(value).expect("pinger is alive");
        }
    });

    pin_to_cpu(producer_cpu);

    let start = Instant::now();

    for i in 0..ITERATIONS as Payload {
        ping_tx.send(i).expect("responder is alive");
        let _ = pong_rx.recv().expect("responder still responding");
    }

    let elapsed = start.elapsed();
    responder.join().unwrap();

    let rtt_ns = elapsed.as_nanos() / ITERATIONS as u128;
    println!("{} ns RTT", rtt_ns);
}

fn main() {
    strait::trace::init_tracing();

    let (producer_cpu, consumer_cpu) = get_cpu_affinity();

    println!("strait SPSC (capacity={}, iters={}):", CAPACITY, ITERATIONS);
    bench_throughput(producer_cpu, consumer_cpu);
    bench_rtt(producer_cpu, consumer_cpu);
}
