//! ioctl transport to the privileged driver node.
//!
//! The driver speaks fixed `#[repr(C)]` records over plain ioctls. This
//! module owns the marshalling; nothing above it sees a raw struct. The
//! driver itself is out of scope — requests are validated minimally on
//! return and otherwise trusted.

use crate::{
    check_cpu_info, check_debug_level, check_system_info, host_online_cpus, CpuFamily, CpuInfo,
    DriverError, DriverGateway, InjectRequest, KernelVars, MemOp, SystemInfo, ADDR_SENTINEL,
    MAX_THREADS,
};
use log::debug;
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::Path;

// ─── ioctl command codes ────────────────────────────────────────────
//
// Shared with the driver; the numeric values are part of its ABI.

const IOC_SET_DEBUG: libc::c_ulong = 0xF10_0001;
const IOC_GET_SYSINFO: libc::c_ulong = 0xF10_0002;
const IOC_GET_CPUINFO: libc::c_ulong = 0xF10_0003;
const IOC_INJECT: libc::c_ulong = 0xF10_0004;
const IOC_MEMREQ: libc::c_ulong = 0xF10_0005;
const IOC_ENABLE_ERRORS: libc::c_ulong = 0xF10_0006;
const IOC_FLUSH_CACHE: libc::c_ulong = 0xF10_0007;
const IOC_SET_KVARS: libc::c_ulong = 0xF10_0008;

// ─── raw records ────────────────────────────────────────────────────

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct RawSysInfo {
    ncpus: u32,
    ncpus_online: u32,
    max_cpu_id: u32,
    _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct RawCpuInfo {
    cpu_id: u32,
    family: u32,
    node_id: u32,
    mem_flags: u32,
    mem_start: u64,
    mem_size: u64,
    l2_line_size: u32,
    l2_flush_size: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct RawMemReq {
    subcmd: u32,
    pid: i32,
    vaddr: u64,
    paddr: u64,
}

const MREQ_UVA_TO_PA: u32 = 1;
const MREQ_KVA_TO_PA: u32 = 2;
const MREQ_RA_TO_PA: u32 = 3;
const MREQ_RELEASE_PHYS: u32 = 4;

#[repr(C)]
#[derive(Clone, Copy)]
struct RawInject {
    command: u64,
    flags: u64,
    target_addr: u64,
    xor_pattern: u64,
    buf_base: u64,
    buf_size: u32,
    corrupt_offset: u32,
    access_offset: u32,
    pid: i32,
    thread_count: u32,
    thread_cpu: [i32; MAX_THREADS],
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct RawKvars {
    write: u32,
    debug_level: u32,
    error_reporting: u32,
    ce_throttle: u32,
}

fn raw_inject(req: &InjectRequest) -> RawInject {
    RawInject {
        command: req.command,
        flags: req.flags,
        target_addr: req.target_addr,
        xor_pattern: req.xor_pattern,
        buf_base: req.buf_base,
        buf_size: req.buf_size,
        corrupt_offset: req.corrupt_offset,
        access_offset: req.access_offset,
        pid: req.pid,
        thread_count: req.thread_count,
        thread_cpu: req.thread_cpu,
    }
}

fn family_from_raw(tag: u32) -> Result<CpuFamily, DriverError> {
    match tag {
        1 => Ok(CpuFamily::Kestrel),
        2 => Ok(CpuFamily::Heron),
        other => Err(DriverError::Rejected {
            op: "GetCpuInfo",
            reason: format!("unknown family tag {other}"),
        }),
    }
}

// ─── gateway ────────────────────────────────────────────────────────

/// [`DriverGateway`] over the real driver node.
pub struct DeviceGateway {
    node: File,
}

impl DeviceGateway {
    /// Open the driver node. Failure here is process-fatal for the harness.
    pub fn open(path: &Path) -> Result<Self, DriverError> {
        let node = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| DriverError::Open {
                path: path.display().to_string(),
                source,
            })?;
        debug!("opened driver node {}", path.display());
        Ok(Self { node })
    }

    fn ioctl<T>(&self, cmd: libc::c_ulong, arg: &mut T, op: &'static str) -> Result<(), DriverError> {
        // SAFETY: `arg` points to a live, correctly sized #[repr(C)] record
        // matching the driver ABI for `cmd`; the fd is owned by `self.node`.
        let rc = unsafe { libc::ioctl(self.node.as_raw_fd(), cmd, arg as *mut T) };
        if rc == -1 {
            return Err(DriverError::Ioctl {
                op,
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

impl DriverGateway for DeviceGateway {
    fn set_debug_level(&self, level: u32) -> Result<(), DriverError> {
        check_debug_level(level)?;
        let mut raw = level;
        self.ioctl(IOC_SET_DEBUG, &mut raw, "SetDebugLevel")
    }

    fn system_info(&self) -> Result<SystemInfo, DriverError> {
        let mut raw = RawSysInfo::default();
        self.ioctl(IOC_GET_SYSINFO, &mut raw, "GetSystemInfo")?;
        let info = SystemInfo {
            ncpus: raw.ncpus,
            ncpus_online: raw.ncpus_online,
            max_cpu_id: raw.max_cpu_id,
        };
        check_system_info(&info, host_online_cpus())?;
        Ok(info)
    }

    fn cpu_info(&self, cpu_id: u32) -> Result<CpuInfo, DriverError> {
        let mut raw = RawCpuInfo {
            cpu_id,
            ..RawCpuInfo::default()
        };
        self.ioctl(IOC_GET_CPUINFO, &mut raw, "GetCpuInfo")?;
        let info = CpuInfo {
            cpu_id: raw.cpu_id,
            family: family_from_raw(raw.family)?,
            node_id: raw.node_id,
            mem_start: raw.mem_start,
            mem_size: raw.mem_size,
            mem_flags: raw.mem_flags,
            l2_line_size: raw.l2_line_size,
            l2_flush_size: raw.l2_flush_size,
        };
        check_cpu_info(&info)?;
        Ok(info)
    }

    fn mem_request(&self, op: &MemOp) -> Result<u64, DriverError> {
        let (mut raw, name) = match *op {
            MemOp::UvaToPa { vaddr, pid } => (
                RawMemReq {
                    subcmd: MREQ_UVA_TO_PA,
                    pid,
                    vaddr,
                    paddr: 0,
                },
                "MemoryRequest/UvaToPa",
            ),
            MemOp::KvaToPa { vaddr } => (
                RawMemReq {
                    subcmd: MREQ_KVA_TO_PA,
                    pid: 0,
                    vaddr,
                    paddr: 0,
                },
                "MemoryRequest/KvaToPa",
            ),
            MemOp::RaToPa { raddr } => (
                RawMemReq {
                    subcmd: MREQ_RA_TO_PA,
                    pid: 0,
                    vaddr: raddr,
                    paddr: 0,
                },
                "MemoryRequest/RaToPa",
            ),
            MemOp::ReleasePhys { paddr } => (
                RawMemReq {
                    subcmd: MREQ_RELEASE_PHYS,
                    pid: 0,
                    vaddr: 0,
                    paddr,
                },
                "MemoryRequest/ReleasePhys",
            ),
        };
        self.ioctl(IOC_MEMREQ, &mut raw, name)?;
        if raw.paddr == ADDR_SENTINEL {
            return Err(DriverError::SentinelAddress { op: name });
        }
        Ok(raw.paddr)
    }

    fn inject(&self, req: &InjectRequest) -> Result<(), DriverError> {
        let mut raw = raw_inject(req);
        self.ioctl(IOC_INJECT, &mut raw, "InjectError")
    }

    fn enable_errors(&self, req: &InjectRequest) -> Result<(), DriverError> {
        let mut raw = raw_inject(req);
        self.ioctl(IOC_ENABLE_ERRORS, &mut raw, "EnableErrors")
    }

    fn flush_cache(&self, req: &InjectRequest) -> Result<(), DriverError> {
        let mut raw = raw_inject(req);
        self.ioctl(IOC_FLUSH_CACHE, &mut raw, "FlushCache")
    }

    fn kernel_vars(&self, vars: &mut KernelVars, write: bool) -> Result<(), DriverError> {
        let mut raw = RawKvars {
            write: u32::from(write),
            debug_level: vars.debug_level,
            error_reporting: vars.error_reporting,
            ce_throttle: vars.ce_throttle,
        };
        self.ioctl(IOC_SET_KVARS, &mut raw, "SetKernelVars")?;
        if !write {
            vars.debug_level = raw.debug_level;
            vars.error_reporting = raw.error_reporting;
            vars.ce_throttle = raw.ce_throttle;
            check_debug_level(vars.debug_level)?;
        }
        Ok(())
    }
}
