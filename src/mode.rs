use std::path::Path;

use log::warn;
use nix::sys::signal::{signal, SigHandler, Signal};

/// Operating mode, decided once at start-up and fixed thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// An in-kernel DSM module owns remote memory; the user-level
    /// fallback stays dormant and every operation is a no-op.
    KernelModule,
    /// Faults on registered guest RAM are resolved in user space.
    UserFault,
    /// Neither the kernel module nor a usable fault handle is available.
    /// The VMM runs without DSM.
    Disabled,
}

// Either sentinel is sufficient evidence that the kernel module is loaded.
const KMOD_SENTINELS: [&str; 2] = ["/dev/kvm-dsm", "/sys/module/kvm_dsm"];

/// Whether the in-kernel DSM module is loaded on this host.
pub(crate) fn kernel_module_present() -> bool {
    any_present(KMOD_SENTINELS.iter().map(Path::new))
}

fn any_present<'a, I>(paths: I) -> bool
where
    I: IntoIterator<Item = &'a Path>,
{
    paths.into_iter().any(|p| p.exists())
}

/// Ignore SIGPIPE process-wide.
///
/// A peer that disappears mid-RPC must surface as an EPIPE error from the
/// send, not terminate the VMM.
pub(crate) fn ignore_sigpipe() {
    // Safety: SIG_IGN installs no handler code and SIGPIPE has no
    // meaningful default disposition for this process.
    if let Err(e) = unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) } {
        warn!("Failed to ignore SIGPIPE: {}", e);
    }
}
