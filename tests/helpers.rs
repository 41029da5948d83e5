// Shared test helpers. Not every test binary uses every helper.
#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::thread;

use tempfile::NamedTempFile;

use vmdsm::proto::{encode_request, PAGE_SIZE, RESPONSE_LEN};
use vmdsm::Server;

// Expected image byte for an offset: the low byte of the offset mixed
// with the page index. The page index matters: a plain `offset % 256`
// cycle repeats every page, which would let a response served from the
// wrong page-aligned offset pass the byte checks.
pub fn pattern_at(offset: usize) -> u8 {
    (offset % 256) as u8 ^ ((offset / PAGE_SIZE) % 256) as u8
}

// Lay down a pattern-filled backing image of the given size.
pub fn pattern_image(len: usize) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create image");
    let mut offset = 0;
    while offset < len {
        let n = PAGE_SIZE.min(len - offset);
        let page: Vec<u8> = (offset..offset + n).map(pattern_at).collect();
        file.write_all(&page).expect("Failed to write image");
        offset += n;
    }
    file.flush().expect("Failed to flush image");
    file
}

// Lay down a backing image holding one repeated byte.
pub fn filled_image(len: usize, byte: u8) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create image");
    let chunk = vec![byte; 8192];
    let mut written = 0;
    while written < len {
        let n = chunk.len().min(len - written);
        file.write_all(&chunk[..n]).expect("Failed to write image");
        written += n;
    }
    file.flush().expect("Failed to flush image");
    file
}

// Start a memory server on an ephemeral loopback port and leave it
// running for the rest of the test process.
pub fn start_server(image: &Path) -> SocketAddr {
    let server = Server::bind("127.0.0.1:0".parse().unwrap(), image)
        .expect("Failed to start server");
    let addr = server.local_addr().expect("Failed to get server addr");
    thread::spawn(move || {
        if let Err(e) = server.run() {
            eprintln!("server exited: {:#}", e);
        }
    });
    addr
}

// One blocking RPC, the way a fault worker issues it.
pub fn fetch(addr: SocketAddr, base: u64) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).expect("Failed to connect");
    stream
        .write_all(&encode_request(base))
        .expect("Failed to send request");
    let mut window = vec![0u8; RESPONSE_LEN];
    stream.read_exact(&mut window).expect("Failed to read window");
    window
}
