//! Device-control boundary for the faultline error injector.
//!
//! Every privileged operation — error injection, cache flushes, address
//! translation, kernel-variable access — goes through the [`DriverGateway`]
//! trait. The harness never touches the hardware directly; it marshals a
//! typed request, the driver does the dangerous part, and the response is
//! sanity-checked minimally on return (the driver is trusted, the transport
//! is not assumed bug-free).
//!
//! # Request kinds
//!
//! ```text
//! Harness                    Gateway                     Driver
//! ───────                    ───────                     ──────
//! set_debug_level(n)   ──→   SetDebugLevel         ──→   kvar write
//! system_info()        ──→   GetSystemInfo         ──→   cpu/mem census
//! cpu_info(id)         ──→   GetCpuInfo            ──→   per-cpu topology
//! mem_request(op)      ──→   MemoryRequest{subcmd} ──→   VA/RA/PA walk
//! inject(req)          ──→   InjectError           ──→   corrupt state
//! enable_errors(req)   ──→   EnableErrors          ──→   error reg setup
//! flush_cache(req)     ──→   FlushCache            ──→   cache maintenance
//! kernel_vars(v, rw)   ──→   SetKernelVars         ──→   kvar save/restore
//! ```
//!
//! Two implementations ship: [`device::DeviceGateway`] speaks ioctl to the
//! real driver node, [`sim::SimGateway`] is a deterministic in-memory stand-in
//! for tests and dry runs.

pub mod device;
pub mod sim;

use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════
//  Well-known constants
// ═══════════════════════════════════════════════════════════════════════

/// Default path of the privileged driver node.
pub const DRIVER_NODE: &str = "/dev/faultline";

/// Cache line size every supported family reports. A driver response with a
/// different value means we are talking to the wrong driver (or a corrupted
/// transport) and must not proceed.
pub const CACHE_LINE_SIZE: u32 = 64;

/// Exclusive ceiling for kernel debug levels. Anything at or above this is
/// rejected before it reaches the driver.
pub const DEBUG_LEVEL_CEILING: u32 = 8;

/// Sentinel returned by failed address translations. Callers must never use
/// an address equal to this value.
pub const ADDR_SENTINEL: u64 = u64::MAX;

/// Maximum number of injector threads a single request may carry.
pub const MAX_THREADS: usize = 4;

// ═══════════════════════════════════════════════════════════════════════
//  Request flags
// ═══════════════════════════════════════════════════════════════════════

/// Inject only; the harness skips the invocation access.
pub const FLAG_NO_INVOKE: u64 = 1 << 0;

/// Corrupt check bits instead of data bits.
pub const FLAG_CHECK_BITS: u64 = 1 << 1;

/// The target address names a driver-bound physical mapping that must be
/// released after the command.
pub const FLAG_BOUND_MEM: u64 = 1 << 2;

/// Quiesce by pausing sibling CPUs for the duration of the injection.
pub const FLAG_QUIESCE_PAUSE: u64 = 1 << 3;

/// Quiesce by offlining sibling CPUs for the duration of the injection.
pub const FLAG_QUIESCE_OFFLINE: u64 = 1 << 4;

// ═══════════════════════════════════════════════════════════════════════
//  Wire types
// ═══════════════════════════════════════════════════════════════════════

/// Processor family tag reported by the driver.
///
/// The family selects the arch ops vector in the harness. Kestrel parts sit
/// behind a hypervisor real-address layer and scatter locality across
/// physical-address node bits; Heron parts map memory flat and contiguous
/// per node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuFamily {
    /// Multi-node part with a real-address indirection layer.
    Kestrel,
    /// Flat part; real and physical addresses are identical.
    Heron,
}

/// System census returned by `GetSystemInfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemInfo {
    /// Total CPUs configured.
    pub ncpus: u32,
    /// CPUs currently online.
    pub ncpus_online: u32,
    /// Highest CPU id in use (ids may be sparse).
    pub max_cpu_id: u32,
}

/// Per-CPU topology record returned by `GetCpuInfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuInfo {
    /// CPU id (matches the OS processor id).
    pub cpu_id: u32,
    /// Implementation family.
    pub family: CpuFamily,
    /// Locality node this CPU belongs to.
    pub node_id: u32,
    /// Base of the memory range local to this CPU (Heron locality model).
    pub mem_start: u64,
    /// Size of the local memory range.
    pub mem_size: u64,
    /// Topology flags, see [`MEM_NO_LOCAL_RESTRICTION`].
    pub mem_flags: u32,
    /// L2 line size in bytes; must equal [`CACHE_LINE_SIZE`].
    pub l2_line_size: u32,
    /// Bytes of displacement traffic needed to flush the whole L2.
    pub l2_flush_size: u32,
}

/// Memory on this CPU has no local/remote distinction (single-node parts,
/// or interleave configurations too fine to matter).
pub const MEM_NO_LOCAL_RESTRICTION: u32 = 1 << 0;

/// Sub-commands of the `MemoryRequest` gateway call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemOp {
    /// Translate a user virtual address in `pid`'s address space.
    UvaToPa { vaddr: u64, pid: i32 },
    /// Translate a kernel virtual address.
    KvaToPa { vaddr: u64 },
    /// Translate a real address to a true physical address.
    RaToPa { raddr: u64 },
    /// Release a driver-held physical-memory binding.
    ReleasePhys { paddr: u64 },
}

/// Saved kernel debug variables.
///
/// These are global driver/kernel knobs the injector overwrites for the
/// duration of a run; the [`ConfigStore`] in the harness keeps the one true
/// snapshot across concurrent injector processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KernelVars {
    /// Driver debug verbosity, below [`DEBUG_LEVEL_CEILING`].
    pub debug_level: u32,
    /// Kernel error-report verbosity.
    pub error_reporting: u32,
    /// Correctable-error throttle interval.
    pub ce_throttle: u32,
}

/// Per-invocation injection transaction.
///
/// Mutable while the harness prepares a command, then handed to the driver
/// (and to the capability handler) read-only. One request describes the
/// whole command including every thread's CPU binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectRequest {
    /// Numeric command code from the catalog.
    pub command: u64,
    /// `FLAG_*` bits.
    pub flags: u64,
    /// Corruption target address (meaning depends on the command's mode).
    pub target_addr: u64,
    /// Xor pattern applied to the target word.
    pub xor_pattern: u64,
    /// Byte offset of the corruption within the target line.
    pub corrupt_offset: u32,
    /// Byte offset of the invocation access.
    pub access_offset: u32,
    /// Address space owner for user-virtual targets.
    pub pid: i32,
    /// Base of the data buffer backing the command, 0 if none.
    pub buf_base: u64,
    /// Size of the data buffer.
    pub buf_size: u32,
    /// Number of injector threads this command runs.
    pub thread_count: u32,
    /// CPU id bound to each thread, -1 where unused.
    pub thread_cpu: [i32; MAX_THREADS],
}

impl InjectRequest {
    /// A request with nothing resolved yet.
    pub fn empty() -> Self {
        Self {
            command: 0,
            flags: 0,
            target_addr: 0,
            xor_pattern: 0,
            corrupt_offset: 0,
            access_offset: 0,
            pid: 0,
            buf_base: 0,
            buf_size: 0,
            thread_count: 1,
            thread_cpu: [-1; MAX_THREADS],
        }
    }

    /// Whether `flag` is set.
    #[inline]
    pub fn has_flag(&self, flag: u64) -> bool {
        self.flags & flag != 0
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Errors
// ═══════════════════════════════════════════════════════════════════════

/// Failures crossing the gateway.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The driver node could not be opened.
    #[error("failed to open driver node {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// An ioctl round trip failed.
    #[error("driver request {op} failed: {source}")]
    Ioctl {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The driver rejected a request outright.
    #[error("driver rejected {op}: {reason}")]
    Rejected { op: &'static str, reason: String },

    /// A translation request returned the sentinel address.
    #[error("driver returned sentinel address for {op}")]
    SentinelAddress { op: &'static str },

    /// The reported CPU census disagrees with the host's own count.
    #[error("driver reports {reported} online cpus but the host sees {host}")]
    CpuCountMismatch { reported: u32, host: u32 },

    /// A CPU count field that must be positive was not.
    #[error("driver reported a non-positive cpu count: {0:?}")]
    BadCpuCount(SystemInfo),

    /// A cache line-size field did not match [`CACHE_LINE_SIZE`].
    #[error("cpu {cpu_id} reports l2 line size {reported}, expected {CACHE_LINE_SIZE}")]
    BadLineSize { cpu_id: u32, reported: u32 },

    /// A kernel debug level at or above [`DEBUG_LEVEL_CEILING`].
    #[error("debug level {0} is at or above the ceiling {DEBUG_LEVEL_CEILING}")]
    DebugLevelTooHigh(u32),
}

// ═══════════════════════════════════════════════════════════════════════
//  Gateway trait
// ═══════════════════════════════════════════════════════════════════════

/// The opaque device-control boundary.
///
/// Implementations must be callable from any harness thread; the producer
/// thread issues `inject` while the orchestrating thread owns everything
/// else.
pub trait DriverGateway: Send + Sync {
    /// `SetDebugLevel` — set driver verbosity. Validated against
    /// [`DEBUG_LEVEL_CEILING`] before the round trip.
    fn set_debug_level(&self, level: u32) -> Result<(), DriverError>;

    /// `GetSystemInfo` — CPU/memory census.
    fn system_info(&self) -> Result<SystemInfo, DriverError>;

    /// `GetCpuInfo` — topology record for one CPU.
    fn cpu_info(&self, cpu_id: u32) -> Result<CpuInfo, DriverError>;

    /// `MemoryRequest` — address translations and physical-binding release.
    /// Translation sub-commands return the resulting physical address.
    fn mem_request(&self, op: &MemOp) -> Result<u64, DriverError>;

    /// `InjectError` — corrupt state as described by `req`.
    fn inject(&self, req: &InjectRequest) -> Result<(), DriverError>;

    /// `EnableErrors` — program error-detection registers.
    fn enable_errors(&self, req: &InjectRequest) -> Result<(), DriverError>;

    /// `FlushCache` — driver-side cache maintenance.
    fn flush_cache(&self, req: &InjectRequest) -> Result<(), DriverError>;

    /// `SetKernelVars` — read (`write == false`) or restore
    /// (`write == true`) the kernel debug variables.
    fn kernel_vars(&self, vars: &mut KernelVars, write: bool) -> Result<(), DriverError>;
}

// ═══════════════════════════════════════════════════════════════════════
//  Response sanity checks
// ═══════════════════════════════════════════════════════════════════════

/// Check a `GetSystemInfo` response against the host's own online-CPU count.
pub fn check_system_info(info: &SystemInfo, host_online: u32) -> Result<(), DriverError> {
    if info.ncpus == 0 || info.ncpus_online == 0 {
        return Err(DriverError::BadCpuCount(*info));
    }
    if info.ncpus_online != host_online {
        return Err(DriverError::CpuCountMismatch {
            reported: info.ncpus_online,
            host: host_online,
        });
    }
    Ok(())
}

/// Check a `GetCpuInfo` response.
pub fn check_cpu_info(info: &CpuInfo) -> Result<(), DriverError> {
    if info.l2_line_size != CACHE_LINE_SIZE {
        return Err(DriverError::BadLineSize {
            cpu_id: info.cpu_id,
            reported: info.l2_line_size,
        });
    }
    Ok(())
}

/// Check a debug level against the ceiling.
pub fn check_debug_level(level: u32) -> Result<(), DriverError> {
    if level >= DEBUG_LEVEL_CEILING {
        return Err(DriverError::DebugLevelTooHigh(level));
    }
    Ok(())
}

/// Check a kernel-variable snapshot before it crosses the gateway.
pub fn check_kernel_vars(vars: &KernelVars) -> Result<(), DriverError> {
    check_debug_level(vars.debug_level)
}

/// The host's own online-CPU count, used to cross-check the driver census.
pub fn host_online_cpus() -> u32 {
    // SAFETY: sysconf with a valid name has no memory-safety preconditions.
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n <= 0 {
        0
    } else {
        n as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(ncpus: u32, online: u32) -> SystemInfo {
        SystemInfo {
            ncpus,
            ncpus_online: online,
            max_cpu_id: ncpus.saturating_sub(1),
        }
    }

    #[test]
    fn system_info_accepts_matching_census() {
        assert!(check_system_info(&info(8, 8), 8).is_ok());
    }

    #[test]
    fn system_info_rejects_zero_cpus() {
        assert!(matches!(
            check_system_info(&info(0, 0), 8),
            Err(DriverError::BadCpuCount(_))
        ));
    }

    #[test]
    fn system_info_rejects_count_mismatch() {
        assert!(matches!(
            check_system_info(&info(8, 8), 4),
            Err(DriverError::CpuCountMismatch { reported: 8, host: 4 })
        ));
    }

    #[test]
    fn cpu_info_rejects_foreign_line_size() {
        let mut ci = sim::SimGateway::default_cpu(0, CpuFamily::Heron, 0);
        ci.l2_line_size = 128;
        assert!(matches!(
            check_cpu_info(&ci),
            Err(DriverError::BadLineSize { reported: 128, .. })
        ));
    }

    #[test]
    fn debug_level_ceiling_is_exclusive() {
        assert!(check_debug_level(DEBUG_LEVEL_CEILING - 1).is_ok());
        assert!(check_debug_level(DEBUG_LEVEL_CEILING).is_err());
    }
}
