use std::sync::{Arc, PoisonError, RwLock};
use std::thread;

use libc::c_void;
use log::{debug, info, warn};

use crate::config::ClusterConfig;
use crate::fault::FaultHandle;
use crate::mode::{self, Mode};
use crate::pool::NodePool;
use crate::proto::{page_align_down, PAGE_SIZE};
use crate::worker::{self, WORKER_THREADS};

/// The DSM subsystem, initialised once and embedded in the VMM process.
///
/// Construction never fails the embedding VMM: if neither the kernel
/// module nor a fault handle is available the instance is simply
/// [`Mode::Disabled`] and every operation is a no-op.
pub struct Dsm {
    mode: Mode,
    ctx: Option<Arc<FaultCtx>>,
}

/// Everything the fault workers share: the fault handle, the connection
/// pool, and the registered-region table.
pub(crate) struct FaultCtx {
    pub(crate) handle: FaultHandle,
    pub(crate) pool: NodePool,
    regions: RegionTable,
}

/// A faulting address resolved against the region table.
pub(crate) struct FaultSite {
    /// Page base in this process's address space.
    pub(crate) page_base: usize,
    /// Byte offset of that page in the cluster memory image.
    pub(crate) shard_offset: u64,
    /// Whole pages between `page_base` and the end of its region. Caps
    /// how much of a prefetch window can actually be installed.
    pub(crate) pages_to_end: usize,
}

#[derive(Clone, Copy)]
struct Region {
    base: usize,
    len: usize,
    shard_offset: u64,
}

/// Registered RAM regions in registration order.
///
/// Regions are registered once per RAM block and never removed, so this
/// is append-only. Registration order defines each region's offset into
/// the cluster memory image: region N starts where region N-1 ended.
#[derive(Default)]
struct RegionTable {
    regions: RwLock<Vec<Region>>,
}

impl RegionTable {
    fn add(&self, base: usize, len: usize) -> u64 {
        let mut regions = self
            .regions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let shard_offset = regions.iter().map(|r| r.len as u64).sum();
        regions.push(Region {
            base,
            len,
            shard_offset,
        });
        shard_offset
    }

    fn resolve(&self, addr: usize) -> Option<FaultSite> {
        let regions = self
            .regions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let region = regions
            .iter()
            .find(|r| addr >= r.base && addr < r.base + r.len)?;
        let page_base = page_align_down(addr);
        Some(FaultSite {
            page_base,
            shard_offset: region.shard_offset + (page_base - region.base) as u64,
            pages_to_end: (region.base + region.len - page_base) / PAGE_SIZE,
        })
    }
}

impl FaultCtx {
    pub(crate) fn resolve(&self, addr: usize) -> Option<FaultSite> {
        self.regions.resolve(addr)
    }
}

impl Dsm {
    /// Probe the environment and bring up the subsystem.
    ///
    /// Order matters: an in-kernel DSM module always wins and leaves this
    /// layer dormant. Otherwise the fault handle is opened and the worker
    /// pool starts; if the handle cannot be opened the VMM continues
    /// without DSM.
    pub fn auto_setup(config: ClusterConfig) -> Dsm {
        mode::ignore_sigpipe();

        if mode::kernel_module_present() {
            info!("in-kernel DSM module present, user-level fallback dormant");
            return Dsm {
                mode: Mode::KernelModule,
                ctx: None,
            };
        }

        let handle = match FaultHandle::open() {
            Ok(handle) => handle,
            Err(e) => {
                warn!("DSM disabled: {:#}", e);
                return Dsm {
                    mode: Mode::Disabled,
                    ctx: None,
                };
            }
        };

        let ctx = Arc::new(FaultCtx {
            handle,
            pool: NodePool::new(config.nodes),
            regions: RegionTable::default(),
        });
        info!(
            "user-level DSM active: {} node(s), {} worker(s)",
            ctx.pool.node_count(),
            WORKER_THREADS
        );

        for id in 0..WORKER_THREADS {
            let ctx = Arc::clone(&ctx);
            thread::Builder::new()
                .name(format!("dsm-worker-{}", id))
                .spawn(move || worker::run(ctx, id))
                // A VMM that cannot start its fault workers cannot run
                // the guest at all.
                .expect("Failed to spawn DSM worker");
        }

        Dsm {
            mode: Mode::UserFault,
            ctx: Some(ctx),
        }
    }

    /// The mode this process settled on at start-up.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Register a guest RAM region for missing-page tracking.
    ///
    /// No-op unless the mode is [`Mode::UserFault`]. Registration failures
    /// are logged, not fatal: an unregistered region simply never faults
    /// into this subsystem.
    pub fn register(&self, ptr: *mut c_void, len: usize) {
        let Some(ctx) = &self.ctx else {
            return;
        };

        if ptr as usize % PAGE_SIZE != 0 || len % PAGE_SIZE != 0 {
            warn!(
                "RAM region {:p}+{:#x} is not page aligned, not registering",
                ptr, len
            );
            return;
        }

        let shard_offset = ctx.regions.add(ptr as usize, len);
        debug!(
            "guest RAM {:p}+{:#x} maps to shard offset {:#x}",
            ptr, len, shard_offset
        );

        if let Err(e) = ctx.handle.watch(ptr, len) {
            warn!("{:#}", e);
        }
    }
}
