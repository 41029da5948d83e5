use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, warn};

use crate::dsm::{FaultCtx, FaultSite};
use crate::fault::Install;
use crate::pool::{NodeConn, NodePool};
use crate::proto::{encode_request, owner_of, PAGE_SIZE, PREFETCH, RESPONSE_LEN};

/// Fixed worker-pool size. Debug builds keep the pool small.
#[cfg(debug_assertions)]
pub(crate) const WORKER_THREADS: usize = 8;
/// Fixed worker-pool size. Debug builds keep the pool small.
#[cfg(not(debug_assertions))]
pub(crate) const WORKER_THREADS: usize = 64;

/// Events drained per wakeup; amortises the event-read syscall.
const BATCH_SIZE: usize = 64;

/// Readiness-poll timeout. Expiry is benign and just loops.
const POLL_TIMEOUT_MS: u16 = 2000;

const CONNECT_ATTEMPTS: u32 = 5;
const RETRY_BACKOFF: Duration = Duration::from_millis(1);

/// Worker main loop: poll the fault handle, drain a batch of events, and
/// resolve each fault. Runs until the process exits.
pub(crate) fn run(ctx: Arc<FaultCtx>, id: usize) {
    raise_rt_priority(id);

    let mut window = vec![0u8; RESPONSE_LEN];
    loop {
        match ctx.handle.wait_readable(POLL_TIMEOUT_MS) {
            Ok(true) => (),
            Ok(false) => continue,
            Err(e) => {
                warn!("worker {}: fault poll failed: {:#}", id, e);
                continue;
            }
        }

        let faults = match ctx.handle.next_faults(BATCH_SIZE) {
            Ok(faults) => faults,
            Err(e) => {
                warn!("worker {}: event read failed: {:#}", id, e);
                continue;
            }
        };

        for addr in faults {
            handle_fault(&ctx, id, addr, &mut window);
        }
    }
}

/// Resolve one fault: fetch the prefetch window from the owning node and
/// install it, or zero-fill if the node is unreachable.
fn handle_fault(ctx: &FaultCtx, id: usize, fault_addr: usize, window: &mut [u8]) {
    let Some(site) = ctx.resolve(fault_addr) else {
        // The kernel only notifies on registered ranges, so a miss means
        // the region table is out of sync with it.
        error!(
            "worker {}: fault at {:#x} outside any registered region",
            id, fault_addr
        );
        return;
    };

    let owner = owner_of(site.shard_offset, ctx.pool.node_count());
    let Some(mut conn) = acquire_with_retry(&ctx.pool, owner) else {
        warn!(
            "worker {}: node {} unreachable, zero-filling page {:#x}",
            id, owner, site.page_base
        );
        unblock(ctx, site.page_base);
        return;
    };

    // One serialised RPC under the node mutex. On any error the slot is
    // torn down and we bail out; the vCPU re-faults and the next attempt
    // starts from a fresh connection.
    if let Err(e) = fetch_window(conn.stream(), site.shard_offset, window) {
        debug!("worker {}: RPC to node {} failed: {}", id, owner, e);
        conn.mark_bad();
        return;
    }
    // Release the node before the purely local install work.
    drop(conn);

    install_window(ctx, id, &site, window);
}

fn fetch_window(stream: &mut std::net::TcpStream, offset: u64, window: &mut [u8]) -> io::Result<()> {
    stream.write_all(&encode_request(offset))?;
    stream.read_exact(window)
}

/// Install the fetched window, one page at a time.
///
/// EEXIST means a racing worker already resolved a page; the waiters
/// still get an explicit wake. Other install errors are skipped, but for
/// the faulting page itself (k = 0) that would leave a vCPU stalled on a
/// page this worker claimed, so it is loud.
fn install_window(ctx: &FaultCtx, id: usize, site: &FaultSite, window: &[u8]) {
    let pages = PREFETCH.min(site.pages_to_end);
    for (k, page) in window.chunks_exact(PAGE_SIZE).take(pages).enumerate() {
        let dst = site.page_base + k * PAGE_SIZE;
        match ctx.handle.copy_into(page, dst) {
            Ok(Install::Done) => (),
            Ok(Install::AlreadyMapped) => {
                if let Err(e) = ctx.handle.wake(dst, PAGE_SIZE) {
                    warn!("worker {}: {:#}", id, e);
                }
            }
            Err(e) if k == 0 => error!("worker {}: {:#}", id, e),
            Err(e) => debug!("worker {}: skipping prefetched page: {:#}", id, e),
        }
    }
}

/// Last-resort liveness: the owner is unreachable, so the faulting page
/// becomes a zero page rather than leaving the vCPU stalled forever. The
/// guest sees wrong (zero) contents for that page.
fn unblock(ctx: &FaultCtx, page_base: usize) {
    match ctx.handle.zero_into(page_base) {
        Ok(Install::Done) => (),
        Ok(Install::AlreadyMapped) => {
            if let Err(e) = ctx.handle.wake(page_base, PAGE_SIZE) {
                warn!("{:#}", e);
            }
        }
        Err(e) => error!("Failed to unblock page {:#x}: {:#}", page_base, e),
    }
}

fn acquire_with_retry(pool: &NodePool, node: usize) -> Option<NodeConn<'_>> {
    for attempt in 1..=CONNECT_ATTEMPTS {
        match pool.acquire(node) {
            Ok(conn) => return Some(conn),
            Err(e) => {
                debug!(
                    "connect attempt {}/{} to node {} failed: {:#}",
                    attempt, CONNECT_ATTEMPTS, node, e
                );
                thread::sleep(RETRY_BACKOFF * attempt);
            }
        }
    }
    None
}

/// Best-effort round-robin real-time priority so fault resolution
/// preempts ordinary VMM housekeeping. Refusal (no privilege) is fine.
fn raise_rt_priority(id: usize) {
    let param = libc::sched_param { sched_priority: 1 };
    // Safety: plain syscall on the calling thread with a valid param.
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_RR, &param) };
    if rc != 0 {
        debug!(
            "worker {}: SCHED_RR elevation refused: {}",
            id,
            io::Error::last_os_error()
        );
    }
}
