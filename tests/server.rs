use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use rand::Rng;
use test_log::test;

use vmdsm::proto::{encode_request, PAGE_SIZE, RESPONSE_LEN};

mod helpers;
use helpers::*;

// A request for offset 0 is answered with exactly the first window of the
// backing file.
#[test]
fn test_window_round_trip() {
    let image = pattern_image(1 << 20);
    let addr = start_server(image.path());

    let window = fetch(addr, 0);
    let expected: Vec<u8> = (0..RESPONSE_LEN).map(pattern_at).collect();
    assert_eq!(window, expected);

    let window = fetch(addr, PAGE_SIZE as u64);
    let expected: Vec<u8> = (PAGE_SIZE..PAGE_SIZE + RESPONSE_LEN)
        .map(pattern_at)
        .collect();
    assert_eq!(window, expected);
}

// A connection is long-lived and carries many request/response pairs.
#[test]
fn test_many_requests_one_connection() {
    let image = pattern_image(1 << 20);
    let addr = start_server(image.path());

    let mut stream = TcpStream::connect(addr).expect("Failed to connect");
    let mut window = vec![0u8; RESPONSE_LEN];
    for base in [0u64, 4096, 0, 131072, 524288] {
        stream
            .write_all(&encode_request(base))
            .expect("Failed to send");
        stream.read_exact(&mut window).expect("Failed to read");
        assert_eq!(window[0], pattern_at(base as usize));
        assert_eq!(
            window[RESPONSE_LEN - 1],
            pattern_at(base as usize + RESPONSE_LEN - 1)
        );
    }
}

// Requests that would run past the image end are served from offset 0.
#[test]
fn test_out_of_range_clamps_to_start() {
    let len = RESPONSE_LEN + PAGE_SIZE;
    let image = pattern_image(len);
    let addr = start_server(image.path());

    let from_start = fetch(addr, 0);
    // One page past the last offset that still fits a full window.
    assert_eq!(fetch(addr, (2 * PAGE_SIZE) as u64), from_start);
    assert_eq!(fetch(addr, len as u64), from_start);
    assert_eq!(fetch(addr, u64::MAX & !(PAGE_SIZE as u64 - 1)), from_start);
}

// The last offset that fits a full window is served in place, not clamped.
#[test]
fn test_last_window_not_clamped() {
    let image = pattern_image(RESPONSE_LEN + PAGE_SIZE);
    let addr = start_server(image.path());

    let window = fetch(addr, PAGE_SIZE as u64);
    assert_eq!(window[0], pattern_at(PAGE_SIZE));
}

// Many connections hammering random offsets all get byte-exact answers
// out of the one event loop.
#[test]
fn test_concurrent_clients_byte_exact() {
    const CLIENTS: usize = 8;
    const REQUESTS: usize = 200;
    const IMAGE_LEN: usize = 4 << 20;

    let image = pattern_image(IMAGE_LEN);
    let addr = start_server(image.path());

    let last_page = (IMAGE_LEN - RESPONSE_LEN) / PAGE_SIZE;
    let mut clients = Vec::new();
    for _ in 0..CLIENTS {
        clients.push(thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).expect("Failed to connect");
            let mut rng = rand::thread_rng();
            let mut window = vec![0u8; RESPONSE_LEN];
            for _ in 0..REQUESTS {
                let base = rng.gen_range(0..=last_page) * PAGE_SIZE;
                stream
                    .write_all(&encode_request(base as u64))
                    .expect("Failed to send");
                stream.read_exact(&mut window).expect("Failed to read");
                assert_eq!(window[0], pattern_at(base));
                assert_eq!(window[PAGE_SIZE], pattern_at(base + PAGE_SIZE));
                assert_eq!(
                    window[RESPONSE_LEN - 1],
                    pattern_at(base + RESPONSE_LEN - 1)
                );
            }
        }));
    }
    for client in clients {
        client.join().expect("Client thread panicked");
    }
}

// A request header split across two sends is reassembled across
// readiness events and served normally.
#[test]
fn test_split_header_is_served() {
    let image = pattern_image(1 << 20);
    let addr = start_server(image.path());

    let mut stream = TcpStream::connect(addr).expect("Failed to connect");
    let header = encode_request(PAGE_SIZE as u64);
    stream.write_all(&header[..4]).expect("Failed to send");
    thread::sleep(Duration::from_millis(50));
    stream.write_all(&header[4..]).expect("Failed to send");

    let mut window = vec![0u8; RESPONSE_LEN];
    stream.read_exact(&mut window).expect("Failed to read");
    assert_eq!(window[0], pattern_at(PAGE_SIZE));
}

// A client stalled mid-header must not hold up other connections; the
// handler yields back to the event loop instead of waiting in place.
#[test]
fn test_partial_header_does_not_block_others() {
    let image = pattern_image(1 << 20);
    let addr = start_server(image.path());

    let mut stalled = TcpStream::connect(addr).expect("Failed to connect");
    stalled
        .write_all(&encode_request(0)[..4])
        .expect("Failed to send partial header");

    // Served while the first client is still mid-header.
    let window = fetch(addr, PAGE_SIZE as u64);
    assert_eq!(window[0], pattern_at(PAGE_SIZE));

    // The stalled client can still finish its request afterwards.
    stalled
        .write_all(&encode_request(0)[4..])
        .expect("Failed to send rest of header");
    let mut window = vec![0u8; RESPONSE_LEN];
    stalled.read_exact(&mut window).expect("Failed to read");
    assert_eq!(window[0], pattern_at(0));
}

// A client that abandons a half-sent header costs the server one
// connection, not the process.
#[test]
fn test_short_header_closes_connection_only() {
    let image = pattern_image(1 << 20);
    let addr = start_server(image.path());

    {
        let mut stream = TcpStream::connect(addr).expect("Failed to connect");
        stream
            .write_all(&encode_request(0)[..4])
            .expect("Failed to send partial header");
    }

    // The next connection is served normally.
    let window = fetch(addr, 0);
    assert_eq!(window[0], 0);
}
