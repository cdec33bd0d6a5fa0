//! CPU affinity shim.
//!
//! A single call pins the current OS thread to one CPU. Failure is logged
//! and non-fatal: the runtime proceeds unpinned.

/// Pin the calling thread to `cpu`. Returns `true` on success.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(cpu: usize) -> bool {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        let ret = libc::pthread_setaffinity_np(
            libc::pthread_self(),
            std::mem::size_of::<libc::cpu_set_t>(),
            &set,
        );
        if ret != 0 {
            log::warn!("set thread affinity to cpu {} failed: errno {}", cpu, ret);
            return false;
        }
    }
    true
}

/// Pinning is unsupported on this platform; the runtime runs unpinned.
#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(cpu: usize) -> bool {
    log::warn!("thread affinity not supported on this platform (cpu {})", cpu);
    false
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
