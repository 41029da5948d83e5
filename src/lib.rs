#![deny(missing_docs)]
//! User-level distributed shared memory fallback for a VMM.
//!
//! When the in-kernel DSM module is absent, this crate presents the guest
//! with a contiguous physical address space whose contents live on remote
//! nodes: guest page faults are intercepted via userfaultfd, the missing
//! page (plus a prefetch window) is fetched from the owning node's memory
//! server, and the data is installed in place, unblocking the faulting
//! vCPU. The companion `vmdsm-server` binary is the per-node memory
//! provider.

/// Cluster configuration.
pub mod config;
/// Subsystem bootstrap and the embedding API.
pub mod dsm;
/// Per-node connection pool.
pub mod pool;
/// Wire protocol, sharding, and page constants.
pub mod proto;
/// The memory-provider server.
pub mod server;

pub use crate::config::ClusterConfig;
pub use crate::dsm::Dsm;
pub use crate::mode::Mode;
pub use crate::server::Server;

mod fault;
mod mode;
mod worker;
