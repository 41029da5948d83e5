//! Sharded connection pool: one cached TCP connection per remote node,
//! each slot guarded by its own mutex.
//!
//! The mutex is the whole protocol. Holding a [`NodeConn`] is the only way
//! to touch a node's socket, so at most one request is ever in flight per
//! node and the unframed wire protocol stays safe on a shared connection.

use std::net::{SocketAddr, TcpStream};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use log::debug;
use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};

/// Send and receive buffer size for node connections.
const SOCKET_BUF_BYTES: usize = 2 << 20;

/// Bounds how long a worker can sit on a dead peer, per operation.
const IO_TIMEOUT: Duration = Duration::from_secs(2);

/// Bounds the initial TCP connect.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

const KEEPALIVE_IDLE: Duration = Duration::from_secs(5);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(2);
const KEEPALIVE_PROBES: u32 = 3;

struct Node {
    addr: SocketAddr,
    slot: Mutex<Option<TcpStream>>,
}

/// The per-node connection pool.
pub struct NodePool {
    nodes: Vec<Node>,
}

/// Exclusive access to one node's connection.
///
/// Dropping the guard releases the node for other workers with the
/// connection kept for reuse; [`NodeConn::mark_bad`] tears the connection
/// down first so the next holder reconnects.
pub struct NodeConn<'a> {
    guard: MutexGuard<'a, Option<TcpStream>>,
}

impl NodePool {
    /// Build a pool with one empty slot per node address.
    pub fn new(addrs: Vec<SocketAddr>) -> Self {
        Self {
            nodes: addrs
                .into_iter()
                .map(|addr| Node {
                    addr,
                    slot: Mutex::new(None),
                })
                .collect(),
        }
    }

    /// Number of nodes, which is also the shard modulus.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Lock node `node` and hand out its connection, dialing first if the
    /// slot is empty.
    ///
    /// On connect failure the slot's mutex is released before returning,
    /// so a dead node never wedges other workers that want to retry it.
    pub fn acquire(&self, node: usize) -> Result<NodeConn<'_>> {
        let n = &self.nodes[node];
        // A poisoned slot just means some worker died mid-RPC; the stream
        // it left behind is torn down like any other suspect connection.
        let mut guard = n
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            let stream = connect(n.addr)
                .with_context(|| format!("Failed to connect node {} at {}", node, n.addr))?;
            debug!("connected node {} at {}", node, n.addr);
            *guard = Some(stream);
        }
        Ok(NodeConn { guard })
    }
}

impl NodeConn<'_> {
    /// The node's connection, for one serialised request/response pair.
    pub fn stream(&mut self) -> &mut TcpStream {
        // unwrap() never fires: acquire() only hands out populated slots
        // and the slot cannot change while this guard exists.
        self.guard.as_mut().unwrap()
    }

    /// Tear down the connection and release the node.
    ///
    /// The socket closes with linger zero, so churn through dead peers
    /// does not pile up TIME_WAIT state.
    pub fn mark_bad(mut self) {
        *self.guard = None;
    }
}

fn connect(addr: SocketAddr) -> Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .context("Failed to create socket")?;
    socket.set_nodelay(true)?;
    socket.set_send_buffer_size(SOCKET_BUF_BYTES)?;
    socket.set_recv_buffer_size(SOCKET_BUF_BYTES)?;
    socket.set_linger(Some(Duration::from_secs(0)))?;
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_IDLE)
        .with_interval(KEEPALIVE_INTERVAL)
        .with_retries(KEEPALIVE_PROBES);
    socket.set_tcp_keepalive(&keepalive)?;
    socket.set_read_timeout(Some(IO_TIMEOUT))?;
    socket.set_write_timeout(Some(IO_TIMEOUT))?;
    socket.connect_timeout(&addr.into(), CONNECT_TIMEOUT)?;
    Ok(socket.into())
}
