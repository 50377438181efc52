//! Throughput benchmark for the KiWi priority queue.
//!
//! Spawns worker threads that mix pushes and pops over a bounded key range
//! for a fixed interval, then appends the measured throughput to a CSV.

use std::fs::{create_dir_all, OpenOptions};
use std::io::{stdout, Write};
use std::sync::{mpsc, Arc, Barrier};
use std::time::{Duration, Instant};

use clap::{value_parser, Arg, Command};
use crossbeam_utils::thread::scope;
use csv::Writer;
use rand::prelude::*;

use kiwi_queue::KiwiQueue;

struct Config {
    threads: usize,
    push_rate: u8,
    range: u64,
    prefill: u64,
    interval: u64,
    duration: Duration,
}

fn main() {
    let matches = Command::new("kiwi-bench")
        .arg(
            Arg::new("threads")
                .short('t')
                .value_parser(value_parser!(usize))
                .required(true)
                .help("Number of worker threads."),
        )
        .arg(
            Arg::new("push rate")
                .short('p')
                .value_parser(value_parser!(u8).range(0..=100))
                .default_value("50")
                .help("The proportion of `push` operations, in percent."),
        )
        .arg(
            Arg::new("range")
                .short('r')
                .value_parser(value_parser!(u64))
                .default_value("100000")
                .help("Key range: [0..RANGE]"),
        )
        .arg(
            Arg::new("interval")
                .short('i')
                .value_parser(value_parser!(u64))
                .default_value("10")
                .help("Time interval in seconds to run the benchmark"),
        )
        .arg(Arg::new("output").short('o').help(
            "Output CSV filename. \
             Appends the data if the file already exists.\n\
             [default: results/kiwi.csv]",
        ))
        .get_matches();

    let threads = matches.get_one::<usize>("threads").copied().unwrap();
    let push_rate = matches.get_one::<u8>("push rate").copied().unwrap();
    let range = matches.get_one::<u64>("range").copied().unwrap();
    let interval = matches.get_one::<u64>("interval").copied().unwrap();
    let config = Config {
        threads,
        push_rate,
        range,
        prefill: range / 2,
        interval,
        duration: Duration::from_secs(interval),
    };

    let output_name = matches
        .get_one::<String>("output")
        .cloned()
        .unwrap_or_else(|| "results/kiwi.csv".to_string());
    create_dir_all("results").unwrap();
    let mut output = match OpenOptions::new().append(true).open(&output_name) {
        Ok(f) => Writer::from_writer(f),
        Err(_) => {
            let f = OpenOptions::new()
                .write(true)
                .create(true)
                .open(&output_name)
                .unwrap();
            let mut output = Writer::from_writer(f);
            output
                .write_record(["threads", "push_rate", "key_range", "interval", "throughput"])
                .unwrap();
            output.flush().unwrap();
            output
        }
    };

    let ops_per_sec = bench(&config);
    output
        .write_record(&[
            config.threads.to_string(),
            config.push_rate.to_string(),
            config.range.to_string(),
            config.interval.to_string(),
            ops_per_sec.to_string(),
        ])
        .unwrap();
    output.flush().unwrap();
    println!("ops/s: {}", ops_per_sec);
}

fn bench(config: &Config) -> u64 {
    println!(
        "kiwi-queue: {} threads, p{}, r{}, {}s",
        config.threads, config.push_rate, config.range, config.interval
    );
    let queue: KiwiQueue<u64> = KiwiQueue::with_max_threads(config.threads + 1);

    let rng = &mut rand::thread_rng();
    for _ in 0..config.prefill {
        queue.push(rng.gen_range(0..config.range));
    }
    print!("prefilled... ");
    stdout().flush().unwrap();

    let barrier = &Arc::new(Barrier::new(config.threads));
    let (ops_sender, ops_receiver) = mpsc::channel();

    scope(|s| {
        for _ in 0..config.threads {
            let ops_sender = ops_sender.clone();
            let queue = &queue;
            s.spawn(move |_| {
                let mut ops: u64 = 0;
                let rng = &mut rand::thread_rng();
                barrier.clone().wait();
                let start = Instant::now();

                while start.elapsed() < config.duration {
                    if rng.gen_range(0..100) < config.push_rate {
                        queue.push(rng.gen_range(0..config.range));
                    } else {
                        let _ = queue.try_pop();
                    }
                    ops += 1;
                }

                ops_sender.send(ops).unwrap();
            });
        }
    })
    .unwrap();
    println!("end");

    let mut ops = 0;
    for _ in 0..config.threads {
        ops += ops_receiver.recv().unwrap();
    }
    ops / config.interval
}
