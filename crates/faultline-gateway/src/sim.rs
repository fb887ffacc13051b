//! Deterministic in-memory gateway for tests and dry runs.
//!
//! [`SimGateway`] models just enough driver state to exercise the harness:
//! a configurable CPU topology, page maps for the three translation
//! sub-commands, kernel-variable storage, and per-operation failure
//! switches. Everything it is asked to do is recorded so tests can assert
//! on the traffic that crossed the boundary.

use crate::{
    check_debug_level, CpuFamily, CpuInfo, DriverError, DriverGateway, InjectRequest, KernelVars,
    MemOp, SystemInfo, CACHE_LINE_SIZE, MEM_NO_LOCAL_RESTRICTION,
};
use log::debug;
use std::collections::HashMap;
use std::sync::Mutex;

/// Physical addresses the sim hands out are confined to 44 bits.
const PA_MASK: u64 = (1 << 44) - 1;

/// Bytes of memory modeled per locality node.
const NODE_MEM_SIZE: u64 = 0x2_0000_0000;

#[derive(Default)]
struct SimState {
    debug_level: u32,
    cpus: Vec<CpuInfo>,
    uva_map: HashMap<(u64, i32), u64>,
    kva_map: HashMap<u64, u64>,
    ra_map: HashMap<u64, u64>,
    /// Applied to unmapped real addresses so the extra hop is observable.
    real_offset: u64,
    kvars: KernelVars,
    kvar_writes: u32,
    injected: Vec<InjectRequest>,
    enabled: Vec<InjectRequest>,
    flushed: Vec<InjectRequest>,
    released_phys: Vec<u64>,
    fail_inject: bool,
    fail_mem_request: bool,
}

/// In-memory [`DriverGateway`].
pub struct SimGateway {
    state: Mutex<SimState>,
}

impl SimGateway {
    /// A topology with the given explicit CPU records.
    pub fn with_cpus(cpus: Vec<CpuInfo>) -> Self {
        Self {
            state: Mutex::new(SimState {
                cpus,
                ..SimState::default()
            }),
        }
    }

    /// `node_ids[i]` becomes the node of CPU `i`; all CPUs share `family`.
    pub fn nodes(family: CpuFamily, node_ids: &[u32]) -> Self {
        let cpus = node_ids
            .iter()
            .enumerate()
            .map(|(i, &node)| Self::default_cpu(i as u32, family, node))
            .collect();
        Self::with_cpus(cpus)
    }

    /// `n` CPUs on node 0.
    pub fn uniform(n: usize, family: CpuFamily) -> Self {
        Self::nodes(family, &vec![0; n])
    }

    /// A plausible CPU record for tests.
    pub fn default_cpu(cpu_id: u32, family: CpuFamily, node_id: u32) -> CpuInfo {
        CpuInfo {
            cpu_id,
            family,
            node_id,
            mem_start: u64::from(node_id) * NODE_MEM_SIZE,
            mem_size: NODE_MEM_SIZE,
            mem_flags: 0,
            l2_line_size: CACHE_LINE_SIZE,
            l2_flush_size: 0x40_0000,
        }
    }

    /// Mark CPU `cpu_id` as having no local/remote memory restriction.
    pub fn set_no_local_restriction(&self, cpu_id: u32) {
        let mut st = self.state.lock().unwrap();
        if let Some(c) = st.cpus.iter_mut().find(|c| c.cpu_id == cpu_id) {
            c.mem_flags |= MEM_NO_LOCAL_RESTRICTION;
        }
    }

    /// Map a user virtual address for `pid`.
    pub fn map_uva(&self, vaddr: u64, pid: i32, paddr: u64) {
        self.state.lock().unwrap().uva_map.insert((vaddr, pid), paddr);
    }

    /// Map a kernel virtual address.
    pub fn map_kva(&self, vaddr: u64, paddr: u64) {
        self.state.lock().unwrap().kva_map.insert(vaddr, paddr);
    }

    /// Map a real address.
    pub fn map_ra(&self, raddr: u64, paddr: u64) {
        self.state.lock().unwrap().ra_map.insert(raddr, paddr);
    }

    /// Offset applied to unmapped real addresses (default 0).
    pub fn set_real_offset(&self, offset: u64) {
        self.state.lock().unwrap().real_offset = offset;
    }

    /// Make the next and all following `InjectError` requests fail.
    pub fn set_fail_inject(&self, fail: bool) {
        self.state.lock().unwrap().fail_inject = fail;
    }

    /// Make all `MemoryRequest` round trips fail.
    pub fn set_fail_mem_request(&self, fail: bool) {
        self.state.lock().unwrap().fail_mem_request = fail;
    }

    /// Seed the stored kernel variables.
    pub fn set_kvars(&self, kvars: KernelVars) {
        self.state.lock().unwrap().kvars = kvars;
    }

    /// Every `InjectError` request seen so far.
    pub fn injected(&self) -> Vec<InjectRequest> {
        self.state.lock().unwrap().injected.clone()
    }

    /// Every `FlushCache` request seen so far.
    pub fn flushed(&self) -> Vec<InjectRequest> {
        self.state.lock().unwrap().flushed.clone()
    }

    /// Every `EnableErrors` request seen so far.
    pub fn enabled(&self) -> Vec<InjectRequest> {
        self.state.lock().unwrap().enabled.clone()
    }

    /// Physical bindings released via `MemoryRequest/ReleasePhys`.
    pub fn released_phys(&self) -> Vec<u64> {
        self.state.lock().unwrap().released_phys.clone()
    }

    /// Number of `SetKernelVars` restore (write) round trips.
    pub fn kvar_writes(&self) -> u32 {
        self.state.lock().unwrap().kvar_writes
    }

    /// Current driver debug level.
    pub fn debug_level(&self) -> u32 {
        self.state.lock().unwrap().debug_level
    }
}

impl DriverGateway for SimGateway {
    fn set_debug_level(&self, level: u32) -> Result<(), DriverError> {
        check_debug_level(level)?;
        self.state.lock().unwrap().debug_level = level;
        Ok(())
    }

    fn system_info(&self) -> Result<SystemInfo, DriverError> {
        let st = self.state.lock().unwrap();
        let max_cpu_id = st.cpus.iter().map(|c| c.cpu_id).max().unwrap_or(0);
        Ok(SystemInfo {
            ncpus: st.cpus.len() as u32,
            ncpus_online: st.cpus.len() as u32,
            max_cpu_id,
        })
    }

    fn cpu_info(&self, cpu_id: u32) -> Result<CpuInfo, DriverError> {
        let st = self.state.lock().unwrap();
        st.cpus
            .iter()
            .find(|c| c.cpu_id == cpu_id)
            .copied()
            .ok_or_else(|| DriverError::Rejected {
                op: "GetCpuInfo",
                reason: format!("no such cpu {cpu_id}"),
            })
    }

    fn mem_request(&self, op: &MemOp) -> Result<u64, DriverError> {
        let mut st = self.state.lock().unwrap();
        if st.fail_mem_request {
            return Err(DriverError::Rejected {
                op: "MemoryRequest",
                reason: "simulated translation failure".into(),
            });
        }
        let pa = match *op {
            // Unmapped virtual addresses translate by identity-with-mask so
            // tests only map what they care about.
            MemOp::UvaToPa { vaddr, pid } => st
                .uva_map
                .get(&(vaddr, pid))
                .copied()
                .unwrap_or(vaddr & PA_MASK),
            MemOp::KvaToPa { vaddr } => {
                st.kva_map.get(&vaddr).copied().unwrap_or(vaddr & PA_MASK)
            }
            MemOp::RaToPa { raddr } => st
                .ra_map
                .get(&raddr)
                .copied()
                .unwrap_or_else(|| raddr.wrapping_add(st.real_offset) & PA_MASK),
            MemOp::ReleasePhys { paddr } => {
                st.released_phys.push(paddr);
                0
            }
        };
        Ok(pa)
    }

    fn inject(&self, req: &InjectRequest) -> Result<(), DriverError> {
        let mut st = self.state.lock().unwrap();
        if st.fail_inject {
            return Err(DriverError::Rejected {
                op: "InjectError",
                reason: "simulated injection failure".into(),
            });
        }
        debug!(
            "sim inject: command={:#x} addr={:#x} xor={:#x}",
            req.command, req.target_addr, req.xor_pattern
        );
        st.injected.push(req.clone());
        Ok(())
    }

    fn enable_errors(&self, req: &InjectRequest) -> Result<(), DriverError> {
        self.state.lock().unwrap().enabled.push(req.clone());
        Ok(())
    }

    fn flush_cache(&self, req: &InjectRequest) -> Result<(), DriverError> {
        self.state.lock().unwrap().flushed.push(req.clone());
        Ok(())
    }

    fn kernel_vars(&self, vars: &mut KernelVars, write: bool) -> Result<(), DriverError> {
        let mut st = self.state.lock().unwrap();
        if write {
            st.kvars = *vars;
            st.kvar_writes += 1;
        } else {
            *vars = st.kvars;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmapped_uva_translates_by_identity() {
        let sim = SimGateway::uniform(2, CpuFamily::Heron);
        let pa = sim
            .mem_request(&MemOp::UvaToPa { vaddr: 0x1000, pid: 1 })
            .unwrap();
        assert_eq!(pa, 0x1000);
    }

    #[test]
    fn mapped_uva_wins_over_identity() {
        let sim = SimGateway::uniform(2, CpuFamily::Heron);
        sim.map_uva(0x1000, 7, 0xdead_0000);
        let pa = sim
            .mem_request(&MemOp::UvaToPa { vaddr: 0x1000, pid: 7 })
            .unwrap();
        assert_eq!(pa, 0xdead_0000);
        // A different pid does not see the mapping.
        let pa = sim
            .mem_request(&MemOp::UvaToPa { vaddr: 0x1000, pid: 8 })
            .unwrap();
        assert_eq!(pa, 0x1000);
    }

    #[test]
    fn real_offset_applies_to_unmapped_ra() {
        let sim = SimGateway::uniform(1, CpuFamily::Kestrel);
        sim.set_real_offset(0x10_0000_0000);
        let pa = sim.mem_request(&MemOp::RaToPa { raddr: 0x2000 }).unwrap();
        assert_eq!(pa, 0x10_0000_2000);
    }

    #[test]
    fn kvar_round_trip_and_write_count() {
        let sim = SimGateway::uniform(1, CpuFamily::Heron);
        sim.set_kvars(KernelVars {
            debug_level: 2,
            error_reporting: 1,
            ce_throttle: 16,
        });

        let mut vars = KernelVars::default();
        sim.kernel_vars(&mut vars, false).unwrap();
        assert_eq!(vars.debug_level, 2);
        assert_eq!(sim.kvar_writes(), 0);

        vars.ce_throttle = 99;
        sim.kernel_vars(&mut vars, true).unwrap();
        assert_eq!(sim.kvar_writes(), 1);

        let mut back = KernelVars::default();
        sim.kernel_vars(&mut back, false).unwrap();
        assert_eq!(back.ce_throttle, 99);
    }

    #[test]
    fn inject_failure_switch() {
        let sim = SimGateway::uniform(1, CpuFamily::Heron);
        sim.set_fail_inject(true);
        let req = InjectRequest::empty();
        assert!(sim.inject(&req).is_err());
        assert!(sim.injected().is_empty());
    }
}
