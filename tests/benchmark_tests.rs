//! Performance benchmarks for the protocol hot paths

use server::coalescer::SendCoalescer;
use server::config::ServerConfig;
use server::gateway::Gateway;
use server::sequencer::ChannelSequencer;
use shared::frame::{encode, encode_ack, parse_acks, AckEntry};
use shared::{Frame, MessageType, PayloadReader, PayloadWriter, MAX_DATAGRAM_LEN};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Benchmarks frame encoding and decoding
#[test]
fn benchmark_frame_codec() {
    let payload = [0xABu8; 64];
    let iterations = 100_000;
    let start = Instant::now();

    for i in 0..iterations {
        let bytes = encode(MessageType::ordered(6), (i * 2) as u16, &payload).unwrap();
        let (frame, consumed) = Frame::decode(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(frame.payload.len(), payload.len());
    }

    let duration = start.elapsed();
    println!(
        "Frame codec: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    // Should complete in under 1 second
    assert!(duration.as_millis() < 1000);
}

/// Benchmarks payload writing and reading
#[test]
fn benchmark_payload_serialization() {
    let iterations = 50_000;
    let start = Instant::now();

    for i in 0..iterations {
        let mut writer = PayloadWriter::with_opcode(1);
        writer
            .put_string("PlayerBase")
            .put_u16(i as u16)
            .put_f32(i as f32)
            .put_u32(i);
        let bytes = writer.into_bytes();

        let mut reader = PayloadReader::new(&bytes);
        assert_eq!(reader.read_u8().unwrap(), 1);
        assert_eq!(reader.read_string().unwrap(), "PlayerBase");
    }

    let duration = start.elapsed();
    println!(
        "Payload serialization: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 1000);
}

/// Benchmarks sequencer classification with periodic gaps
#[test]
fn benchmark_sequencer() {
    let mut sequencer = ChannelSequencer::new();
    let mut sequences = [0u16; 32];
    let iterations: u32 = 30_000;
    let start = Instant::now();

    for i in 0..iterations {
        let channel = (i % 32) as usize;
        // Every tenth frame on a channel skips one sequence, which is filled right after
        let step = if (i / 32) % 10 == 0 { 4 } else { 2 };
        sequences[channel] = sequences[channel].wrapping_add(step);
        let sequence = sequences[channel];
        sequencer.classify(channel as u8, sequence);
        if step == 4 {
            sequencer.classify(channel as u8, sequence.wrapping_sub(2));
        }
    }
    assert_eq!(sequencer.missing_count(), 0);

    let duration = start.elapsed();
    println!(
        "Sequencer: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 500);
}

/// Benchmarks ack encoding and parsing for a full datagram of triplets
#[test]
fn benchmark_ack_triplets() {
    let entries: Vec<AckEntry> = (0..300u16)
        .map(|i| AckEntry::for_sequence(0x48, i * 2))
        .collect();
    let iterations = 5_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let bytes = encode_ack(&entries);
        let parsed = parse_acks(&bytes[5..]);
        assert_eq!(parsed.len(), entries.len());
    }

    let duration = start.elapsed();
    println!(
        "Ack triplets: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 1000);
}

/// Benchmarks the coalescer filling and flushing datagrams
#[test]
fn benchmark_coalescer() {
    let mut coalescer = SendCoalescer::new(MAX_DATAGRAM_LEN, Duration::from_millis(15));
    let frame = [0u8; 40];
    let iterations = 100_000;
    let mut flushed = 0;
    let now = Instant::now();
    let start = Instant::now();

    for _ in 0..iterations {
        if let Some(datagram) = coalescer.push(&frame, now) {
            assert!(datagram.len() <= MAX_DATAGRAM_LEN);
            flushed += 1;
        }
    }

    let duration = start.elapsed();
    println!(
        "Coalescer: {} pushes, {} datagrams in {:?}",
        iterations, flushed, duration
    );

    assert!(flushed > 0);
    assert!(duration.as_millis() < 500);
}

/// Benchmarks the gateway answering pings from many peers
#[test]
fn benchmark_gateway_ping_handling() {
    let mut gateway = Gateway::with_config(ServerConfig {
        max_connected: 1000,
        ..ServerConfig::default()
    });
    let peers: Vec<SocketAddr> = (0..100)
        .map(|i| format!("127.0.0.1:{}", 20000 + i).parse().unwrap())
        .collect();

    let syn = encode(MessageType::Connect, 0, &[0u8; 13]).unwrap();
    let established = encode(MessageType::ConnectionEstablished, 0, &[]).unwrap();
    for peer in &peers {
        gateway.handle_datagram(*peer, &syn, Instant::now());
        gateway.handle_datagram(*peer, &established, Instant::now());
    }
    gateway.registry_mut().flush_all();
    gateway.drain_outbox();

    let ping = shared::frame::encode_ping(1);
    let iterations = 200;
    let start = Instant::now();

    for _ in 0..iterations {
        for peer in &peers {
            gateway.handle_datagram(*peer, &ping, Instant::now());
        }
        assert_eq!(gateway.drain_outbox().len(), peers.len());
    }

    let duration = start.elapsed();
    println!(
        "Gateway pings: {} datagrams in {:?}",
        iterations * peers.len(),
        duration
    );

    assert!(duration.as_millis() < 1000);
}
