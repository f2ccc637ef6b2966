//! Byte queue pipeline: a chain of tiny queues connected by forwarder
//! threads must deliver every byte, in order, through repeated
//! fill/drain/shutdown cycles.

use std::sync::Arc;
use std::thread;

use parzip::{ByteQueue, QueueState};

/// Pump one queue into another until the upstream shuts down, then shut the
/// downstream too.
fn forwarder(input: Arc<ByteQueue>, output: Arc<ByteQueue>) {
    loop {
        input.wait_until_full_or_shutdown();
        let data = input.pop();
        if output.push(&data).is_err() {
            input.shutdown();
            return;
        }
        if input.state() == QueueState::Shutdown {
            let last = input.pop();
            if !last.is_empty() {
                let _ = output.push(&last);
            }
            output.shutdown();
            return;
        }
    }
}

/// Drain a queue to completion.
fn get_all(q: &ByteQueue) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        q.wait_until_full_or_shutdown();
        out.extend_from_slice(&q.pop());
        if q.state() == QueueState::Shutdown {
            out.extend_from_slice(&q.pop());
            return out;
        }
    }
}

fn run_chain(message: &[u8]) -> Vec<u8> {
    // Awkward relatively-prime capacities so every boundary case in the
    // multi-round push gets exercised.
    let capacities = [1usize, 2, 3, 5, 7, 11, 13];
    let queues: Vec<Arc<ByteQueue>> = capacities
        .iter()
        .map(|&c| Arc::new(ByteQueue::new(c)))
        .collect();

    let mut handles = Vec::new();
    for i in 0..queues.len() - 1 {
        let input = Arc::clone(&queues[i + 1]);
        let output = Arc::clone(&queues[i]);
        handles.push(thread::spawn(move || forwarder(input, output)));
    }

    let deepest = Arc::clone(&queues[queues.len() - 1]);
    let msg = message.to_vec();
    let pusher = thread::spawn(move || {
        deepest.push(&msg).unwrap();
        deepest.shutdown();
    });

    let result = get_all(&queues[0]);
    pusher.join().unwrap();
    for h in handles {
        h.join().unwrap();
    }
    result
}

#[test]
fn chained_queues_preserve_the_byte_sequence() {
    let mut message = Vec::new();
    for _ in 0..4 {
        message.extend_from_slice(b"ABCDEFGHIJKLMNOPQRSTUVWXYZ");
    }
    message.extend_from_slice(b"0123456789");
    assert_eq!(message.len(), 114);

    let out = run_chain(&message);
    assert_eq!(out, message);
}

#[test]
fn chain_survives_an_empty_message() {
    let out = run_chain(b"");
    assert!(out.is_empty());
}

#[test]
fn chain_handles_single_bytes() {
    let out = run_chain(b"Q");
    assert_eq!(out, b"Q");
}
