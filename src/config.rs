use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::proto::SERVER_PORT;

/// Well-known cluster config file, read from the working directory.
///
/// One node IP per line, blank lines ignored. Line order is shard order.
pub const CONFIG_FILE: &str = "cluster_uffd.conf";

/// The set of remote memory nodes for this guest.
///
/// The entry count fixes the node count for the process lifetime; a page's
/// owner is its page index modulo that count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Node addresses in shard order.
    pub nodes: Vec<SocketAddr>,
}

impl ClusterConfig {
    /// Load the cluster config from [`CONFIG_FILE`].
    ///
    /// A missing file is not an error; it means a single-node cluster on
    /// loopback. A file that exists but does not parse is fatal since
    /// guessing a topology would shard guest memory wrong.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// Load the cluster config from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents)
                .with_context(|| format!("Failed to parse {}", path.display())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    /// Parse config file contents: one IP per line, blank lines ignored.
    pub fn parse(contents: &str) -> Result<Self> {
        let mut nodes = Vec::new();
        for (idx, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let ip: IpAddr = line
                .parse()
                .with_context(|| format!("Bad node address '{}' on line {}", line, idx + 1))?;
            nodes.push(SocketAddr::new(ip, SERVER_PORT));
        }

        if nodes.is_empty() {
            bail!("No node addresses configured");
        }

        Ok(Self { nodes })
    }
}

impl Default for ClusterConfig {
    /// Compiled-in fallback: a single node on loopback.
    fn default() -> Self {
        Self {
            nodes: vec![SocketAddr::new(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                SERVER_PORT,
            )],
        }
    }
}
