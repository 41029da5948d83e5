//! The memory-provider server: answers page requests out of a
//! memory-mapped backing image.
//!
//! Single-threaded edge-triggered event loop. Scaling out on one node
//! means running several identical processes against the same image; the
//! listener binds with port reuse so the kernel spreads accepts across
//! them, and the read-only map needs no cross-process synchronisation.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use memmap2::{Advice, Mmap};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use socket2::{Domain, Protocol, Socket, Type};

use crate::proto::{decode_request, REQUEST_LEN, RESPONSE_LEN};

const LISTEN_BACKLOG: libc::c_int = 20000;

/// Readiness events drained per multiplexer wakeup.
const MAX_EVENTS: usize = 64;

/// A client may hold a response stream stalled this long before the
/// connection is cut loose.
const STALL_LIMIT: Duration = Duration::from_secs(5);

/// Sleep between send retries while a client's window is full.
const STALL_POLL: Duration = Duration::from_micros(50);

/// One memory-provider process.
pub struct Server {
    listener: TcpListener,
    listen_token: u64,
    image: Mmap,
    epoll: Epoll,
    conns: HashMap<u64, Conn>,
}

/// One client connection with its partially read request header.
///
/// TCP may split even an 8-byte write, and the handler must not wait for
/// the remainder in place; the partial header is carried here so the read
/// resumes on the connection's next readiness event.
struct Conn {
    stream: TcpStream,
    header: [u8; REQUEST_LEN],
    filled: usize,
}

impl Conn {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            header: [0; REQUEST_LEN],
            filled: 0,
        }
    }
}

impl Server {
    /// Map the backing image, bind the listener, and set up the event
    /// loop. Nothing is served until [`Server::run`].
    pub fn bind(addr: SocketAddr, image_path: &Path) -> Result<Self> {
        let image = map_image(image_path)?;
        let listener = listen(addr)?;

        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .context("Failed to create epoll instance")?;
        let listen_token = listener.as_raw_fd() as u64;
        epoll
            .add(
                &listener,
                EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLET, listen_token),
            )
            .context("Failed to register listener with epoll")?;

        info!(
            "serving {} ({} MiB) on {}",
            image_path.display(),
            image.len() >> 20,
            listener.local_addr().context("Failed to get local addr")?,
        );

        Ok(Self {
            listener,
            listen_token,
            image,
            epoll,
            conns: HashMap::new(),
        })
    }

    /// The bound address, useful when binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to get local addr")
    }

    /// Run the event loop forever.
    pub fn run(mut self) -> Result<()> {
        let mut events = [EpollEvent::empty(); MAX_EVENTS];
        loop {
            let n = match self.epoll.wait(&mut events, EpollTimeout::NONE) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e).context("epoll wait failed"),
            };
            for event in &events[..n] {
                let token = event.data();
                if token == self.listen_token {
                    self.accept_ready();
                } else {
                    self.conn_ready(token);
                }
            }
        }
    }

    /// Drain the accept queue. Edge-triggered registration means a partial
    /// drain would strand connections until the next inbound SYN.
    fn accept_ready(&mut self) {
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    // Routine per-connection failures (ECONNABORTED and
                    // friends) must not end the drain: queued connections
                    // would strand until the next inbound SYN re-arms the
                    // edge-triggered listener.
                    warn!("accept failed: {}", e);
                    continue;
                }
            };
            if let Err(e) = self.add_conn(stream, peer) {
                warn!("dropping connection from {}: {:#}", peer, e);
            }
        }
    }

    fn add_conn(&mut self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        stream
            .set_nonblocking(true)
            .context("Failed to set nonblocking")?;
        stream.set_nodelay(true).context("Failed to set nodelay")?;
        let token = stream.as_raw_fd() as u64;
        self.epoll
            .add(
                &stream,
                EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLET, token),
            )
            .context("Failed to register connection with epoll")?;
        debug!("accepted {}", peer);
        self.conns.insert(token, Conn::new(stream));
        Ok(())
    }

    fn conn_ready(&mut self, token: u64) {
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };
        if serve_requests(conn, &self.image) == ConnState::Closed {
            // Lookup just succeeded, remove cannot miss.
            let conn = self.conns.remove(&token).unwrap();
            let _ = self.epoll.delete(&conn.stream);
        }
    }
}

fn map_image(path: &Path) -> Result<Mmap> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open backing image {}", path.display()))?;
    // Safety: mapped read-only, and the image is not truncated while the
    // server runs.
    let image = unsafe { Mmap::map(&file) }
        .with_context(|| format!("Failed to map backing image {}", path.display()))?;

    if image.len() < RESPONSE_LEN {
        bail!(
            "Backing image {} smaller than one response window ({} < {})",
            path.display(),
            image.len(),
            RESPONSE_LEN
        );
    }

    // The guest faults all over the shard: suppress read-ahead, ask for
    // huge pages, and encourage early paging-in. All best-effort.
    for advice in [Advice::Random, Advice::WillNeed, Advice::HugePage] {
        if let Err(e) = image.advise(advice) {
            debug!("madvise {:?} on backing image refused: {}", advice, e);
        }
    }

    Ok(image)
}

fn listen(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .context("Failed to create listen socket")?;
    socket.set_reuse_address(true)?;
    // Identical server processes on one node share the port and split
    // the accept load.
    socket.set_reuse_port(true)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("Failed to bind {}", addr))?;
    socket
        .listen(LISTEN_BACKLOG)
        .context("Failed to listen")?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

#[derive(Debug, PartialEq)]
enum ConnState {
    Open,
    Closed,
}

enum RequestRead {
    Request(u64),
    /// No complete request pending; wait for the next readiness event.
    Drained,
    Closed,
}

/// Answer requests off one connection until the socket runs dry.
fn serve_requests(conn: &mut Conn, image: &[u8]) -> ConnState {
    loop {
        let base = match read_request(conn) {
            RequestRead::Request(base) => base,
            RequestRead::Drained => return ConnState::Open,
            RequestRead::Closed => return ConnState::Closed,
        };
        if !send_window(&mut conn.stream, response_window(image, base)) {
            return ConnState::Closed;
        }
    }
}

/// Pull one 8-byte request off the socket.
///
/// A short read breaks out to the event loop rather than waiting in
/// place; the partial header stays on the connection and the read picks
/// up where it left off on the next readiness event. A peer that closes
/// with a header still short is violating the protocol.
fn read_request(conn: &mut Conn) -> RequestRead {
    loop {
        match conn.stream.read(&mut conn.header[conn.filled..]) {
            Ok(0) => {
                if conn.filled > 0 {
                    warn!(
                        "peer closed mid-request ({}/{} bytes)",
                        conn.filled, REQUEST_LEN
                    );
                } else {
                    debug!("peer closed");
                }
                return RequestRead::Closed;
            }
            Ok(n) => {
                conn.filled += n;
                if conn.filled == REQUEST_LEN {
                    conn.filled = 0;
                    return RequestRead::Request(decode_request(conn.header));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return RequestRead::Drained,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
            Err(e) => {
                debug!("recv failed: {}", e);
                return RequestRead::Closed;
            }
        }
    }
}

/// The response slice for a request, clamped into the image.
///
/// Out-of-range requests are answered from offset 0 rather than refused;
/// the client is responsible for sensible addresses and a garbage answer
/// keeps its vCPU live where an abrupt close would not.
fn response_window(image: &[u8], base: u64) -> &[u8] {
    let base = match base.checked_add(RESPONSE_LEN as u64) {
        Some(end) if end <= image.len() as u64 => base as usize,
        _ => {
            warn!(
                "request {:#x} beyond image end {:#x}, clamping to 0",
                base,
                image.len()
            );
            0
        }
    };
    &image[base..base + RESPONSE_LEN]
}

/// Stream one response window, riding out short writes and bounded
/// stalls. Returns false when the connection should be closed.
fn send_window(stream: &mut TcpStream, window: &[u8]) -> bool {
    let mut sent = 0;
    let mut stalled_since: Option<Instant> = None;
    while sent < window.len() {
        match stream.write(&window[sent..]) {
            Ok(0) => {
                debug!("send returned zero, closing");
                return false;
            }
            Ok(n) => {
                sent += n;
                // Progress clears any stall.
                stalled_since = None;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let since = *stalled_since.get_or_insert_with(Instant::now);
                if since.elapsed() > STALL_LIMIT {
                    warn!("client stalled past {:?}, closing", STALL_LIMIT);
                    return false;
                }
                thread::sleep(STALL_POLL);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
            Err(e) => {
                debug!("send failed: {}", e);
                return false;
            }
        }
    }
    true
}
