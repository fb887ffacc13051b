//! CPU topology: enumeration, thread-to-CPU selection, OS binding.
//!
//! The CPU list is built once at startup from driver enumeration and
//! cross-checked against the host's own view. Per command, the orchestrator
//! resets the `already_chosen` table and runs [`TopologyBinder::select`] for
//! each thread; within one invocation no two threads can end up on the same
//! CPU because a match marks its descriptor chosen.
//!
//! Selection iterates in ascending CPU id order, so the tie-break among
//! satisfying candidates is always "lowest id".

use crate::arch::ArchOps;
use crate::catalog::CommandDescriptor;
use crate::translate::{AddressTranslator, TranslationError};
use faultline_gateway::{
    check_cpu_info, check_system_info, CpuFamily, CpuInfo, DriverError, DriverGateway,
    InjectRequest, MEM_NO_LOCAL_RESTRICTION,
};
use log::{debug, info, warn};
use std::io;
use thiserror::Error;

/// One processing unit, as seen by the binder.
#[derive(Debug, Clone)]
pub struct CpuDescriptor {
    pub id: u32,
    pub family: CpuFamily,
    pub node_id: u32,
    pub mem_start: u64,
    pub mem_size: u64,
    pub mem_flags: u32,
    pub l2_line_size: u32,
    pub l2_flush_size: u32,
    /// Claimed by a thread of the current invocation.
    pub already_chosen: bool,
}

impl From<CpuInfo> for CpuDescriptor {
    fn from(info: CpuInfo) -> Self {
        Self {
            id: info.cpu_id,
            family: info.family,
            node_id: info.node_id,
            mem_start: info.mem_start,
            mem_size: info.mem_size,
            mem_flags: info.mem_flags,
            l2_line_size: info.l2_line_size,
            l2_flush_size: info.l2_flush_size,
            already_chosen: false,
        }
    }
}

/// Index into the [`CpuSet`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuHandle(pub(crate) usize);

/// What a thread wants from its CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingCriterion {
    /// First unchosen CPU.
    Default,
    /// Exactly this CPU id.
    ByCpuId(u32),
    /// Any CPU of this family.
    ByCpuType(CpuFamily),
    /// A CPU whose local memory contains the command's target.
    LocalMemory,
    /// A CPU remote from the command's target.
    RemoteMemory,
}

/// Binding failures, recovered at the single-command level.
#[derive(Debug, Error)]
pub enum BindingError {
    #[error("no cpu satisfies criterion {criterion:?} for thread {thread_no}")]
    NoMatch {
        thread_no: usize,
        criterion: BindingCriterion,
    },
    #[error("cpu set is empty")]
    NoCpus,
    #[error(transparent)]
    Translation(#[from] TranslationError),
    #[error("failed to bind to cpu {cpu_id}: {source}")]
    Bind {
        cpu_id: u32,
        #[source]
        source: io::Error,
    },
}

// ═══════════════════════════════════════════════════════════════════════
//  CPU set
// ═══════════════════════════════════════════════════════════════════════

/// The per-process CPU arena, ascending id order.
pub struct CpuSet {
    cpus: Vec<CpuDescriptor>,
}

impl CpuSet {
    /// Enumerate online CPUs through the gateway.
    ///
    /// `expected_online` is the caller's independent count (the host's
    /// `sysconf` value in production); any disagreement with the driver
    /// census is fatal.
    pub fn enumerate(
        gateway: &dyn DriverGateway,
        expected_online: u32,
    ) -> Result<Self, DriverError> {
        let info = gateway.system_info()?;
        check_system_info(&info, expected_online)?;

        let mut cpus = Vec::with_capacity(info.ncpus_online as usize);
        // Ids may be sparse; probe the whole id space the census covers.
        for id in 0..=info.max_cpu_id {
            match gateway.cpu_info(id) {
                Ok(ci) => {
                    check_cpu_info(&ci)?;
                    cpus.push(CpuDescriptor::from(ci));
                }
                Err(DriverError::Rejected { .. }) => continue,
                Err(e) => return Err(e),
            }
            if cpus.len() as u32 == info.ncpus_online {
                break;
            }
        }

        if cpus.len() as u32 != info.ncpus_online {
            return Err(DriverError::CpuCountMismatch {
                reported: info.ncpus_online,
                host: cpus.len() as u32,
            });
        }

        cpus.sort_by_key(|c| c.id);
        for c in &cpus {
            info!(
                "cpu {}: family={:?} node={} mem={:#x}+{:#x} l2_line={} l2_flush={:#x}",
                c.id, c.family, c.node_id, c.mem_start, c.mem_size, c.l2_line_size, c.l2_flush_size
            );
        }
        Ok(Self { cpus })
    }

    /// Build directly from descriptors (tests).
    #[cfg(test)]
    pub fn from_descriptors(mut cpus: Vec<CpuDescriptor>) -> Self {
        cpus.sort_by_key(|c| c.id);
        Self { cpus }
    }

    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    pub fn get(&self, handle: CpuHandle) -> &CpuDescriptor {
        &self.cpus[handle.0]
    }

    pub fn iter(&self) -> impl Iterator<Item = &CpuDescriptor> {
        self.cpus.iter()
    }

    /// Forget all claims before a new multi-thread setup.
    pub fn reset_chosen(&mut self) {
        for c in &mut self.cpus {
            c.already_chosen = false;
        }
    }

    fn first_unchosen(&self) -> Option<CpuHandle> {
        self.cpus
            .iter()
            .position(|c| !c.already_chosen)
            .map(CpuHandle)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Binder
// ═══════════════════════════════════════════════════════════════════════

/// The resolved command a binding decision may depend on.
pub struct PendingCommand<'a> {
    pub cmd: &'a CommandDescriptor,
    pub request: &'a InjectRequest,
    pub data_buf: u64,
    pub instr_buf: u64,
}

/// Assigns one CPU per thread for the current invocation.
pub struct TopologyBinder<'a> {
    cpus: &'a mut CpuSet,
    arch: &'static dyn ArchOps,
    translator: &'a AddressTranslator,
}

impl<'a> TopologyBinder<'a> {
    pub fn new(
        cpus: &'a mut CpuSet,
        arch: &'static dyn ArchOps,
        translator: &'a AddressTranslator,
    ) -> Self {
        Self {
            cpus,
            arch,
            translator,
        }
    }

    /// Re-claim the CPU a thread is already bound to. Used when a bound
    /// thread keeps its binding because no criterion was specified.
    pub fn retain(&mut self, thread_no: usize, handle: CpuHandle) {
        let cpu = &mut self.cpus.cpus[handle.0];
        cpu.already_chosen = true;
        debug!("thread {thread_no}: retained cpu {}", cpu.id);
    }

    /// Select a CPU for `thread_no` under `criterion`.
    ///
    /// With a resolved command, memory criteria first resolve the implicated
    /// physical address and compare locality per the arch ops. Without one
    /// (bootstrap), failure is non-fatal and a scratch CPU is returned
    /// unmarked.
    pub fn select(
        &mut self,
        thread_no: usize,
        criterion: BindingCriterion,
        pending: Option<&PendingCommand<'_>>,
    ) -> Result<CpuHandle, BindingError> {
        if self.cpus.is_empty() {
            return Err(BindingError::NoCpus);
        }

        let target_pa = match (criterion, pending) {
            (BindingCriterion::LocalMemory | BindingCriterion::RemoteMemory, Some(p)) => Some(
                self.translator
                    .resolve_target_pa(p.cmd, p.request, p.data_buf, p.instr_buf)?,
            ),
            _ => None,
        };

        for (idx, cpu) in self.cpus.cpus.iter_mut().enumerate() {
            if cpu.already_chosen {
                continue;
            }
            let matched = match criterion {
                BindingCriterion::Default => true,
                BindingCriterion::ByCpuId(id) => cpu.id == id,
                BindingCriterion::ByCpuType(family) => cpu.family == family,
                BindingCriterion::LocalMemory | BindingCriterion::RemoteMemory => {
                    match target_pa {
                        None => false,
                        Some(pa) => {
                            if cpu.mem_flags & MEM_NO_LOCAL_RESTRICTION != 0 {
                                true
                            } else {
                                let local = self.arch.mem_is_local(cpu, pa);
                                if criterion == BindingCriterion::LocalMemory {
                                    local
                                } else {
                                    !local
                                }
                            }
                        }
                    }
                }
            };
            if matched {
                cpu.already_chosen = true;
                debug!("thread {thread_no}: chose cpu {} for {criterion:?}", cpu.id);
                return Ok(CpuHandle(idx));
            }
        }

        if pending.is_none() {
            // Bootstrap: nothing is resolved yet, any CPU will do and the
            // claim is not recorded.
            let handle = self.cpus.first_unchosen().ok_or(BindingError::NoCpus)?;
            debug!(
                "thread {thread_no}: scratch cpu {} (no command resolved)",
                self.cpus.get(handle).id
            );
            return Ok(handle);
        }

        warn!("thread {thread_no}: no cpu matches {criterion:?}");
        Err(BindingError::NoMatch {
            thread_no,
            criterion,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  OS binding
// ═══════════════════════════════════════════════════════════════════════

/// Pin the calling thread to `cpu_id`.
pub fn bind_current_thread(cpu_id: u32) -> Result<(), BindingError> {
    // SAFETY: cpu_set_t is plain data; CPU_ZERO/CPU_SET only write into it.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu_id as usize, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) == -1 {
            return Err(BindingError::Bind {
                cpu_id,
                source: io::Error::last_os_error(),
            });
        }
    }
    debug!("bound current thread to cpu {cpu_id}");
    Ok(())
}

/// Release the calling thread to run anywhere.
pub fn unbind_current_thread() -> Result<(), BindingError> {
    // SAFETY: as above; every representable CPU is set in the mask.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for cpu in 0..libc::CPU_SETSIZE as usize {
            libc::CPU_SET(cpu, &mut set);
        }
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) == -1 {
            return Err(BindingError::Bind {
                cpu_id: u32::MAX,
                source: io::Error::last_os_error(),
            });
        }
    }
    debug!("unbound current thread");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::arch_for;
    use crate::catalog::CommandCatalog;
    use faultline_gateway::sim::SimGateway;
    use faultline_gateway::InjectRequest;
    use std::sync::Arc;

    fn kestrel_set(node_ids: &[u32]) -> CpuSet {
        let cpus = node_ids
            .iter()
            .enumerate()
            .map(|(i, &node)| {
                CpuDescriptor::from(SimGateway::default_cpu(i as u32, CpuFamily::Kestrel, node))
            })
            .collect();
        CpuSet::from_descriptors(cpus)
    }

    fn translator(family: CpuFamily) -> AddressTranslator {
        let sim = Arc::new(SimGateway::uniform(4, family));
        AddressTranslator::new(sim, family == CpuFamily::Kestrel)
    }

    #[test]
    fn enumerate_rejects_census_mismatch() {
        let sim = SimGateway::uniform(4, CpuFamily::Heron);
        assert!(matches!(
            CpuSet::enumerate(&sim, 2),
            Err(DriverError::CpuCountMismatch { reported: 4, host: 2 })
        ));
        assert!(CpuSet::enumerate(&sim, 4).is_ok());
    }

    #[test]
    fn default_takes_lowest_unchosen_id() {
        let mut cpus = kestrel_set(&[0, 0, 0, 0]);
        let tr = translator(CpuFamily::Kestrel);
        let arch = arch_for(CpuFamily::Kestrel);
        let mut binder = TopologyBinder::new(&mut cpus, arch, &tr);

        let a = binder.select(0, BindingCriterion::Default, None).unwrap();
        let b = binder.select(1, BindingCriterion::Default, None).unwrap();
        assert_eq!(cpus.get(a).id, 0);
        assert_eq!(cpus.get(b).id, 1);
        assert!(cpus.get(a).already_chosen);
    }

    #[test]
    fn no_two_threads_share_a_cpu() {
        let mut cpus = kestrel_set(&[0, 0, 1, 1]);
        let tr = translator(CpuFamily::Kestrel);
        let arch = arch_for(CpuFamily::Kestrel);
        let cmd = CommandCatalog::for_family(CpuFamily::Kestrel)
            .lookup("pdce=0")
            .unwrap();
        let req = InjectRequest::empty();
        let pending = PendingCommand {
            cmd,
            request: &req,
            data_buf: 0,
            instr_buf: 0,
        };

        let mut binder = TopologyBinder::new(&mut cpus, arch, &tr);
        let mut handles = Vec::new();
        for t in 0..4 {
            handles.push(binder.select(t, BindingCriterion::Default, Some(&pending)).unwrap());
        }
        let mut ids: Vec<usize> = handles.iter().map(|h| h.0).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 4);

        // Arena exhausted: a fifth thread cannot bind.
        assert!(matches!(
            binder.select(4, BindingCriterion::Default, Some(&pending)),
            Err(BindingError::NoMatch { thread_no: 4, .. })
        ));
    }

    #[test]
    fn remote_then_local_lands_on_both_nodes() {
        // 4 CPUs with node ids [0,0,1,1], target on node 1: thread 0
        // (RemoteMemory) binds a node-0 cpu, thread 1 (LocalMemory) a
        // node-1 cpu.
        let mut cpus = kestrel_set(&[0, 0, 1, 1]);
        let tr = translator(CpuFamily::Kestrel);
        let arch = arch_for(CpuFamily::Kestrel);

        let cmd = CommandCatalog::for_family(CpuFamily::Kestrel)
            .lookup("pdce=0")
            .unwrap();
        let mut req = InjectRequest::empty();
        req.target_addr = (1u64 << 36) | 0x1000; // node 1 physical address
        let pending = PendingCommand {
            cmd,
            request: &req,
            data_buf: 0,
            instr_buf: 0,
        };

        let mut binder = TopologyBinder::new(&mut cpus, arch, &tr);
        let remote = binder
            .select(0, BindingCriterion::RemoteMemory, Some(&pending))
            .unwrap();
        let local = binder
            .select(1, BindingCriterion::LocalMemory, Some(&pending))
            .unwrap();

        assert_eq!(cpus.get(remote).node_id, 0);
        assert_eq!(cpus.get(local).node_id, 1);
        assert_eq!(cpus.get(remote).id, 0); // lowest satisfying id
        assert_eq!(cpus.get(local).id, 2);
    }

    #[test]
    fn no_restriction_bit_matches_any_memory_criterion() {
        let mut cpus = kestrel_set(&[0]);
        cpus.cpus[0].mem_flags |= MEM_NO_LOCAL_RESTRICTION;
        let tr = translator(CpuFamily::Kestrel);
        let arch = arch_for(CpuFamily::Kestrel);
        let cmd = CommandCatalog::for_family(CpuFamily::Kestrel)
            .lookup("pdce=0")
            .unwrap();
        let mut req = InjectRequest::empty();
        req.target_addr = 1u64 << 36; // node 1, nothing local to node 0
        let pending = PendingCommand {
            cmd,
            request: &req,
            data_buf: 0,
            instr_buf: 0,
        };

        let mut binder = TopologyBinder::new(&mut cpus, arch, &tr);
        assert!(binder
            .select(0, BindingCriterion::LocalMemory, Some(&pending))
            .is_ok());
    }

    #[test]
    fn by_cpu_id_and_type_match_exactly() {
        let mut cpus = kestrel_set(&[0, 0]);
        let tr = translator(CpuFamily::Kestrel);
        let arch = arch_for(CpuFamily::Kestrel);
        let cmd = CommandCatalog::for_family(CpuFamily::Kestrel)
            .lookup("udce")
            .unwrap();
        let req = InjectRequest::empty();
        let pending = PendingCommand {
            cmd,
            request: &req,
            data_buf: 0,
            instr_buf: 0,
        };

        let mut binder = TopologyBinder::new(&mut cpus, arch, &tr);
        let h = binder
            .select(0, BindingCriterion::ByCpuId(1), Some(&pending))
            .unwrap();
        assert_eq!(cpus.get(h).id, 1);

        let mut binder = TopologyBinder::new(&mut cpus, arch, &tr);
        assert!(matches!(
            binder.select(1, BindingCriterion::ByCpuType(CpuFamily::Heron), Some(&pending)),
            Err(BindingError::NoMatch { .. })
        ));
    }

    #[test]
    fn bootstrap_memory_criterion_returns_scratch_cpu() {
        let mut cpus = kestrel_set(&[0, 1]);
        let tr = translator(CpuFamily::Kestrel);
        let arch = arch_for(CpuFamily::Kestrel);
        let mut binder = TopologyBinder::new(&mut cpus, arch, &tr);

        let h = binder
            .select(0, BindingCriterion::LocalMemory, None)
            .unwrap();
        assert_eq!(cpus.get(h).id, 0);
        assert!(!cpus.get(h).already_chosen);
    }

    #[test]
    fn reset_chosen_clears_all_claims() {
        let mut cpus = kestrel_set(&[0, 0]);
        let tr = translator(CpuFamily::Kestrel);
        let arch = arch_for(CpuFamily::Kestrel);
        let cmd = CommandCatalog::for_family(CpuFamily::Kestrel)
            .lookup("udce")
            .unwrap();
        let req = InjectRequest::empty();
        let pending = PendingCommand {
            cmd,
            request: &req,
            data_buf: 0,
            instr_buf: 0,
        };
        let mut binder = TopologyBinder::new(&mut cpus, arch, &tr);
        binder.select(0, BindingCriterion::Default, Some(&pending)).unwrap();
        binder.select(1, BindingCriterion::Default, Some(&pending)).unwrap();
        assert!(cpus.iter().all(|c| c.already_chosen));

        cpus.reset_chosen();
        assert!(cpus.iter().all(|c| !c.already_chosen));
    }
}
