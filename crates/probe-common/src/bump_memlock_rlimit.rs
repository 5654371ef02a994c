use nix::sys::resource::{setrlimit, Resource, RLIM_INFINITY};

/// On kernels older than 5.11 the memory used by eBPF maps is accounted
/// against the memlock rlimit, which is far too low by default.
pub fn bump_memlock_rlimit() {
    if let Err(err) = setrlimit(Resource::RLIMIT_MEMLOCK, RLIM_INFINITY, RLIM_INFINITY) {
        log::warn!("Failed to bump memlock rlimit: {}", err);
    }
}
