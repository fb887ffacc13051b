//! Address translation through the driver gateway.
//!
//! Three primitive translations exist, one gateway round trip each:
//! user-virtual, kernel-virtual, and real to physical. On families with a
//! real-address indirection layer every physical-address consumer must chain
//! [`AddressTranslator::to_true_physical`] after the primary translation; on
//! flat families that hop is an identity no-op.
//!
//! Before translating an address owned by the calling process the byte is
//! touched so the mapping is resident when the driver walks it.

use crate::catalog::{AccessClass, CommandDescriptor, TargetKind};
use faultline_gateway::{DriverError, DriverGateway, InjectRequest, MemOp, ADDR_SENTINEL};
use log::debug;
use std::sync::Arc;
use thiserror::Error;

/// Translation failures. Callers must not proceed with a sentinel address.
#[derive(Debug, Error)]
pub enum TranslationError {
    #[error("cannot translate a null address")]
    NullAddress,
    #[error("real-address translation is not supported on this family")]
    NotSupported,
    #[error("driver returned the sentinel address for {va:#x}")]
    Sentinel { va: u64 },
    #[error(transparent)]
    Gateway(#[from] DriverError),
}

/// Translator bound to one gateway and one family's address model.
pub struct AddressTranslator {
    gateway: Arc<dyn DriverGateway>,
    has_real_layer: bool,
}

impl AddressTranslator {
    pub fn new(gateway: Arc<dyn DriverGateway>, has_real_layer: bool) -> Self {
        Self {
            gateway,
            has_real_layer,
        }
    }

    /// Whether this family interposes a real-address layer.
    pub fn has_real_layer(&self) -> bool {
        self.has_real_layer
    }

    /// Translate a user virtual address in `pid`'s address space.
    /// `None` (or a non-positive pid) means the calling process.
    pub fn uva_to_pa(&self, vaddr: u64, pid: Option<i32>) -> Result<u64, TranslationError> {
        if vaddr == 0 {
            return Err(TranslationError::NullAddress);
        }
        let own_pid = std::process::id() as i32;
        let pid = match pid {
            Some(p) if p > 0 => p,
            _ => own_pid,
        };

        if pid == own_pid {
            // Fault the page in before asking the driver about it. Only an
            // address the injector itself owns may be touched.
            // SAFETY: by the calling contract vaddr points into live memory
            // of this process (injection buffers or caller-checked input).
            let byte = unsafe { std::ptr::read_volatile(vaddr as *const u8) };
            std::hint::black_box(byte);
        }

        let pa = self.gateway.mem_request(&MemOp::UvaToPa { vaddr, pid })?;
        self.checked(vaddr, pa, "uva_to_pa")
    }

    /// Translate a kernel virtual address.
    pub fn kva_to_pa(&self, vaddr: u64) -> Result<u64, TranslationError> {
        if vaddr == 0 {
            return Err(TranslationError::NullAddress);
        }
        let pa = self.gateway.mem_request(&MemOp::KvaToPa { vaddr })?;
        self.checked(vaddr, pa, "kva_to_pa")
    }

    /// Translate a real address to a true physical address.
    pub fn ra_to_pa(&self, raddr: u64) -> Result<u64, TranslationError> {
        if !self.has_real_layer {
            return Err(TranslationError::NotSupported);
        }
        let pa = self.gateway.mem_request(&MemOp::RaToPa { raddr })?;
        self.checked(raddr, pa, "ra_to_pa")
    }

    /// Chain the real-address hop where the family has one; identity
    /// otherwise. Primary translations return real addresses on layered
    /// families, so locality comparisons must go through here.
    pub fn to_true_physical(&self, addr: u64) -> Result<u64, TranslationError> {
        if self.has_real_layer {
            self.ra_to_pa(addr)
        } else {
            Ok(addr)
        }
    }

    /// Resolve the physical address a command's corruption lands on.
    ///
    /// The path depends on the command's target kind; buffer-owned commands
    /// implicate the instruction half on fetch access and the data half
    /// otherwise.
    pub fn resolve_target_pa(
        &self,
        cmd: &CommandDescriptor,
        req: &InjectRequest,
        data_buf: u64,
        instr_buf: u64,
    ) -> Result<u64, TranslationError> {
        let pa = match cmd.target {
            TargetKind::ExplicitPhysical => req.target_addr,
            TargetKind::ExplicitReal => self.to_true_physical(req.target_addr)?,
            TargetKind::ExplicitKernelVirtual => {
                let pa = self.kva_to_pa(req.target_addr)?;
                self.to_true_physical(pa)?
            }
            TargetKind::ExplicitUserVirtual => {
                let pa = self.uva_to_pa(req.target_addr, Some(req.pid))?;
                self.to_true_physical(pa)?
            }
            TargetKind::Buffer => {
                let va = if cmd.access == AccessClass::Fetch {
                    instr_buf
                } else {
                    data_buf
                };
                let pa = self.uva_to_pa(va, None)?;
                self.to_true_physical(pa)?
            }
        };
        debug!("resolved target pa {pa:#x} for {}", cmd.name);
        Ok(pa)
    }

    fn checked(&self, va: u64, pa: u64, op: &str) -> Result<u64, TranslationError> {
        if pa == ADDR_SENTINEL {
            return Err(TranslationError::Sentinel { va });
        }
        debug!("{op}: {va:#x} -> {pa:#x}");
        Ok(pa)
    }
}
