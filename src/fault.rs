use std::os::fd::{AsRawFd, BorrowedFd};

use anyhow::{Context, Result};
use libc::c_void;
use log::debug;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use userfaultfd::{Event, Uffd, UffdBuilder};

use crate::proto::PAGE_SIZE;

/// Outcome of a page-install ioctl.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Install {
    /// The page went in and any parked waiters were woken.
    Done,
    /// Another worker resolved the page first; waiters still need an
    /// explicit wake.
    AlreadyMapped,
}

/// The kernel page-fault notification handle.
///
/// Opened non-blocking so a worker can drain a batch of events without
/// parking on the descriptor; readiness comes from [`wait_readable`]
/// instead. The kernel delivers each event to exactly one reader, which is
/// what lets all workers share the one handle.
///
/// [`wait_readable`]: FaultHandle::wait_readable
pub(crate) struct FaultHandle {
    uffd: Uffd,
}

impl FaultHandle {
    /// Open the handle and negotiate the API version.
    pub(crate) fn open() -> Result<Self> {
        let uffd = UffdBuilder::new()
            .close_on_exec(true)
            .non_blocking(true)
            .create()
            .context("Failed to open userfaultfd handle")?;
        Ok(Self { uffd })
    }

    /// Ask for MISSING-fault notifications on `[ptr, ptr + len)`.
    pub(crate) fn watch(&self, ptr: *mut c_void, len: usize) -> Result<()> {
        self.uffd.register(ptr, len).with_context(|| {
            format!("Failed to register {:p}+{:#x} for missing-page tracking", ptr, len)
        })?;
        Ok(())
    }

    /// Block until the handle is readable or `timeout_ms` elapses.
    ///
    /// Returns false on timeout; timeouts are benign and callers just poll
    /// again.
    pub(crate) fn wait_readable(&self, timeout_ms: u16) -> Result<bool> {
        // Safety: the handle outlives the borrow; poll only observes it.
        let fd = unsafe { BorrowedFd::borrow_raw(self.uffd.as_raw_fd()) };
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(timeout_ms)) {
            Ok(0) => Ok(false),
            Ok(_) => Ok(true),
            Err(Errno::EINTR) => Ok(false),
            Err(e) => Err(e).context("Failed to poll fault handle"),
        }
    }

    /// Drain up to `max` pending fault addresses.
    ///
    /// Non-fault events (fork, remap, unmap notifications) carry no work
    /// for us and are dropped.
    pub(crate) fn next_faults(&self, max: usize) -> Result<Vec<usize>> {
        let mut faults = Vec::with_capacity(max);
        while faults.len() < max {
            match self.uffd.read_event().context("Failed to read fault event")? {
                Some(Event::Pagefault { addr, .. }) => faults.push(addr as usize),
                Some(event) => debug!("Ignoring non-fault event: {:?}", event),
                None => break,
            }
        }
        Ok(faults)
    }

    /// Install one page of data at `dst` and wake its waiters.
    pub(crate) fn copy_into(&self, src: &[u8], dst: usize) -> Result<Install> {
        // Safety: dst lies within a range the VMM registered for tracking
        // and src is a live page-sized buffer.
        let r = unsafe {
            self.uffd
                .copy(src.as_ptr() as *const c_void, dst as *mut c_void, src.len(), true)
        };
        match r {
            Ok(_) => Ok(Install::Done),
            Err(e) if is_already_mapped(&e) => Ok(Install::AlreadyMapped),
            Err(e) => Err(e).with_context(|| format!("Failed to install page at {:#x}", dst)),
        }
    }

    /// Install a zero page at `dst` and wake its waiters.
    pub(crate) fn zero_into(&self, dst: usize) -> Result<Install> {
        // Safety: dst lies within a registered range.
        match unsafe { self.uffd.zeropage(dst as *mut c_void, PAGE_SIZE, true) } {
            Ok(_) => Ok(Install::Done),
            Err(e) if is_already_mapped(&e) => Ok(Install::AlreadyMapped),
            Err(e) => Err(e).with_context(|| format!("Failed to zero-fill page at {:#x}", dst)),
        }
    }

    /// Wake anything parked on `[addr, addr + len)` without installing.
    pub(crate) fn wake(&self, addr: usize, len: usize) -> Result<()> {
        self.uffd
            .wake(addr as *mut c_void, len)
            .with_context(|| format!("Failed to wake range {:#x}+{:#x}", addr, len))
    }
}

// EEXIST from an install means another worker won the race for the page,
// which is an expected outcome and not an error.
fn is_already_mapped(err: &userfaultfd::Error) -> bool {
    match err {
        userfaultfd::Error::CopyFailed(errno)
        | userfaultfd::Error::ZeropageFailed(errno)
        | userfaultfd::Error::SystemError(errno) => *errno as i32 == libc::EEXIST,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memmap2::MmapOptions;

    // The fault handle needs kernel support (and possibly privileges)
    // that CI may not have; these tests skip themselves in that case.
    fn open_or_skip() -> Option<FaultHandle> {
        match FaultHandle::open() {
            Ok(handle) => Some(handle),
            Err(e) => {
                eprintln!("userfaultfd unavailable, skipping: {:#}", e);
                None
            }
        }
    }

    #[test]
    fn test_copy_install_is_idempotent() {
        let Some(handle) = open_or_skip() else {
            return;
        };

        let mut region = MmapOptions::new()
            .len(PAGE_SIZE * 2)
            .map_anon()
            .expect("Failed to map region");
        handle
            .watch(region.as_mut_ptr().cast(), region.len())
            .expect("Failed to watch region");

        let base = region.as_ptr() as usize;
        let first = [0xabu8; PAGE_SIZE];
        let second = [0xcdu8; PAGE_SIZE];

        assert_eq!(handle.copy_into(&first, base).unwrap(), Install::Done);
        // The second install loses the race and the original data stays.
        assert_eq!(
            handle.copy_into(&second, base).unwrap(),
            Install::AlreadyMapped
        );
        assert_eq!(region[0], 0xab);
        assert_eq!(region[PAGE_SIZE - 1], 0xab);

        // Waking an already-resolved page is harmless.
        handle.wake(base, PAGE_SIZE).expect("Failed to wake");
    }

    #[test]
    fn test_zero_fill_after_copy_reports_mapped() {
        let Some(handle) = open_or_skip() else {
            return;
        };

        let mut region = MmapOptions::new()
            .len(PAGE_SIZE)
            .map_anon()
            .expect("Failed to map region");
        handle
            .watch(region.as_mut_ptr().cast(), region.len())
            .expect("Failed to watch region");

        let base = region.as_ptr() as usize;
        assert_eq!(handle.zero_into(base).unwrap(), Install::Done);
        assert_eq!(handle.zero_into(base).unwrap(), Install::AlreadyMapped);
        assert_eq!(region[0], 0);
    }

    #[test]
    fn test_wait_readable_times_out_when_idle() {
        let Some(handle) = open_or_skip() else {
            return;
        };
        assert!(!handle.wait_readable(1).expect("Failed to poll"));
        assert!(handle.next_faults(64).expect("Failed to read").is_empty());
    }
}
