//! Wire protocol between fault workers and memory servers.
//!
//! An RPC is a fixed 8-byte big-endian request (a page-aligned byte offset
//! into the cluster's shared memory) answered by exactly
//! [`RESPONSE_LEN`] bytes of raw page contents. There is no framing beyond
//! the fixed sizes; the per-node mutex on the client side is what keeps
//! request/response pairs strictly serialised on a connection.

/// Page granularity for registration, sharding, and installs.
pub const PAGE_SIZE: usize = 4096;

/// Number of contiguous pages fetched and installed per fault.
pub const PREFETCH: usize = 32;

/// Size of a server response: the full prefetch window, raw and unframed.
pub const RESPONSE_LEN: usize = PREFETCH * PAGE_SIZE;

/// Size of a request: one big-endian u64 byte offset.
pub const REQUEST_LEN: usize = 8;

/// TCP port every memory server listens on.
pub const SERVER_PORT: u16 = 9999;

/// Round an address down to its page base.
pub fn page_align_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Which node owns the page at byte offset `base`.
///
/// Shard ownership is a pure function of the page index; there is no
/// runtime renegotiation.
pub fn owner_of(base: u64, node_count: usize) -> usize {
    ((base / PAGE_SIZE as u64) % node_count as u64) as usize
}

/// Encode a page request for the node owning `base`.
pub fn encode_request(base: u64) -> [u8; REQUEST_LEN] {
    base.to_be_bytes()
}

/// Decode a request header received by a server.
pub fn decode_request(header: [u8; REQUEST_LEN]) -> u64 {
    u64::from_be_bytes(header)
}
