//! Per-command test lifecycle.
//!
//! [`TestOrchestrator`] owns everything with per-command lifetime: the
//! [`ThreadContext`] arena, the in-flight [`InjectRequest`], the data
//! buffer, and the batch error counter. One command moves through
//!
//! ```text
//! Idle → PreparingBuffers → ThreadsBound → Executing → PostTest → Idle
//! ```
//!
//! Validation, binding, translation, and synchronization failures are
//! recorded against the command and the batch continues; only
//! initialization failures (driver gateway, CPU enumeration, config store)
//! are fatal to the process.

use crate::arch::{arch_for, ArchOps};
use crate::buffer::{page_size, BufferError, DataBuffer, MIN_DATABUF_SIZE};
use crate::catalog::{
    parse_numeric, split_command_args, AccessClass, Capability, CommandCatalog,
    CommandDescriptor, ProtectionClass,
};
use crate::config::{ConfigStore, ConfigStoreError, DEFAULT_CONFIG_PATH};
use crate::pattern::{self, ParityPolicy, PatternSpec};
use crate::recover;
use crate::sync::{DelayLoop, SyncCell, SyncChannel, SyncError, SyncState, WaitOutcome, SYNC_WAIT_MAX_US};
use crate::topology::{
    bind_current_thread, unbind_current_thread, BindingCriterion, BindingError, CpuHandle,
    CpuSet, PendingCommand, TopologyBinder,
};
use crate::translate::{AddressTranslator, TranslationError};
use faultline_gateway::{
    host_online_cpus, CpuFamily, DriverError, DriverGateway, InjectRequest, MemOp,
    CACHE_LINE_SIZE, FLAG_BOUND_MEM, FLAG_CHECK_BITS, FLAG_NO_INVOKE, FLAG_QUIESCE_OFFLINE,
    FLAG_QUIESCE_PAUSE, MAX_THREADS,
};
use log::{debug, error, info, warn};
use rand_chacha::ChaCha20Rng;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════
//  Errors
// ═══════════════════════════════════════════════════════════════════════

/// Bad or incompatible options for one command.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("unrecognized command {name:?}")]
    UnknownCommand { name: String },
    #[error("command {name} is not implemented or not supported")]
    NotImplemented { name: String },
    #[error("an address argument is required for command {name}")]
    AddressRequired { name: String },
    #[error("invalid argument {arg:?} for command {name}")]
    BadArgument { name: String, arg: String },
    #[error("memory-bound target address {addr:#x} must be page-aligned")]
    MisalignedAddress { addr: u64 },
    #[error("multi-threaded commands cannot be combined with a system-quiesce flag")]
    QuiesceWithThreads,
    #[error("command requires {need} online cpus, only {have} available")]
    NotEnoughCpus { need: u32, have: u32 },
    #[error("{reason}")]
    Unsupported { reason: String },
}

/// Anything that fails one command. Recovered at the batch level.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Binding(#[from] BindingError),
    #[error(transparent)]
    Translation(#[from] TranslationError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error("failed to spawn producer thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Initialization-time failures. Fatal to the whole process.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Config(#[from] ConfigStoreError),
    #[error(transparent)]
    Binding(#[from] BindingError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

// ═══════════════════════════════════════════════════════════════════════
//  Options and plans
// ═══════════════════════════════════════════════════════════════════════

/// System-quiesce request carried on a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuiesceMode {
    #[default]
    None,
    Pause,
    Offline,
}

/// Process-wide harness options.
#[derive(Debug, Clone)]
pub struct HarnessOptions {
    /// Driver debug verbosity set once at startup.
    pub debug_level: u32,
    /// Path of the shared config record.
    pub config_path: PathBuf,
    /// Bound for every synchronization wait.
    pub sync_timeout_us: u64,
    /// Settle delay before buffers are released.
    pub post_test_sleep: Duration,
    /// Seed for random corruption patterns.
    pub seed: u64,
    /// Bit-count heuristic severities.
    pub parity_policy: ParityPolicy,
    /// Pin harness threads with the OS scheduler. Disabled for dry runs,
    /// where selected CPU ids need not exist on the host.
    pub bind_os_threads: bool,
    /// Online-CPU count to validate the driver census against;
    /// `None` uses the host's own count.
    pub expected_online: Option<u32>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            debug_level: 0,
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            sync_timeout_us: SYNC_WAIT_MAX_US,
            post_test_sleep: Duration::ZERO,
            seed: 42,
            parity_policy: ParityPolicy::default(),
            bind_os_threads: true,
            expected_online: None,
        }
    }
}

/// Parsed user intent for one command.
#[derive(Debug, Clone)]
pub struct CommandPlan {
    /// Raw command token, possibly with `=`-arguments.
    pub input: String,
    pub xor_pattern: Option<u64>,
    pub random_pattern: bool,
    pub check_bits: bool,
    pub corrupt_offset: Option<u32>,
    pub access_offset: Option<u32>,
    /// Per-thread binding criteria; missing entries default.
    pub bindings: Vec<BindingCriterion>,
    /// Inject only, skip the invocation access.
    pub no_invoke: bool,
    pub quiesce: QuiesceMode,
    /// Address-space owner override for user-virtual targets.
    pub pid: Option<i32>,
}

impl CommandPlan {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            xor_pattern: None,
            random_pattern: false,
            check_bits: false,
            corrupt_offset: None,
            access_offset: None,
            bindings: Vec::new(),
            no_invoke: false,
            quiesce: QuiesceMode::None,
            pid: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Thread contexts
// ═══════════════════════════════════════════════════════════════════════

/// Lifecycle position of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    PreparingBuffers,
    ThreadsBound,
    Executing,
    PostTest,
}

/// Per-thread state, arena-owned by the orchestrator and re-initialized
/// for every command. Thread 0 is always the consumer; thread 1 the
/// producer of a two-thread command.
#[derive(Debug)]
pub struct ThreadContext {
    pub thread_no: usize,
    pub cpu: Option<CpuHandle>,
    pub bound: bool,
    pub data_buf: u64,
    pub instr_buf: u64,
    pub delay: DelayLoop,
    pub sync: Option<SyncCell>,
}

impl ThreadContext {
    fn new(thread_no: usize) -> Self {
        Self {
            thread_no,
            cpu: None,
            bound: false,
            data_buf: 0,
            instr_buf: 0,
            delay: DelayLoop::from_loops_per_us(1),
            sync: None,
        }
    }

    fn reset(&mut self) {
        self.cpu = None;
        self.data_buf = 0;
        self.instr_buf = 0;
        self.sync = None;
        if self.thread_no != 0 {
            self.bound = false;
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Orchestrator
// ═══════════════════════════════════════════════════════════════════════

/// Drives the per-command lifecycle over one gateway.
pub struct TestOrchestrator {
    gateway: Arc<dyn DriverGateway>,
    opts: HarnessOptions,
    arch: &'static dyn ArchOps,
    cpus: CpuSet,
    translator: AddressTranslator,
    contexts: Vec<ThreadContext>,
    request: InjectRequest,
    state: LifecycleState,
    rng: ChaCha20Rng,
    config: ConfigStore,
    buffer: Option<Arc<DataBuffer>>,
    flush_region: Arc<DataBuffer>,
    batch_errors: u32,
}

impl TestOrchestrator {
    /// Initialize the harness. Every failure here is process-fatal.
    pub fn new(
        gateway: Arc<dyn DriverGateway>,
        opts: HarnessOptions,
    ) -> Result<Self, HarnessError> {
        gateway.set_debug_level(opts.debug_level)?;

        let expected = opts.expected_online.unwrap_or_else(host_online_cpus);
        let mut cpus = CpuSet::enumerate(gateway.as_ref(), expected)?;
        let family = cpus
            .iter()
            .next()
            .map(|c| c.family)
            .ok_or(BindingError::NoCpus)?;
        let arch = arch_for(family);
        let translator = AddressTranslator::new(gateway.clone(), arch.has_real_indirection());

        // The primary thread needs a home before any command is resolved so
        // per-CPU setup can proceed; failure on this path is non-fatal.
        let scratch =
            TopologyBinder::new(&mut cpus, arch, &translator).select(0, BindingCriterion::Default, None);
        let mut contexts: Vec<ThreadContext> = (0..MAX_THREADS).map(ThreadContext::new).collect();
        match scratch {
            Ok(handle) => {
                let cpu_id = cpus.get(handle).id;
                if opts.bind_os_threads {
                    bind_current_thread(cpu_id).map_err(HarnessError::Binding)?;
                    contexts[0].bound = true;
                }
                contexts[0].cpu = Some(handle);
                info!("injector initially bound to cpu {cpu_id} (family {family:?})");
            }
            Err(e) => warn!("bootstrap binding failed, continuing unbound: {e}"),
        }
        contexts[0].delay = DelayLoop::calibrate();

        let flush_size = cpus
            .iter()
            .map(|c| c.l2_flush_size as usize)
            .max()
            .unwrap_or(0x40_0000);
        let flush_region = Arc::new(DataBuffer::alloc_flush_region(flush_size)?);

        let mut config = ConfigStore::new(opts.config_path.clone(), gateway.clone());
        config.acquire()?;

        let rng = pattern::rng_from_seed(opts.seed);
        Ok(Self {
            gateway,
            arch,
            cpus,
            translator,
            contexts,
            request: InjectRequest::empty(),
            state: LifecycleState::Idle,
            rng,
            config,
            buffer: None,
            flush_region,
            batch_errors: 0,
            opts,
        })
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn batch_errors(&self) -> u32 {
        self.batch_errors
    }

    pub fn request(&self) -> &InjectRequest {
        &self.request
    }

    pub fn contexts(&self) -> &[ThreadContext] {
        &self.contexts
    }

    /// Run a batch of commands. Each failure is counted and the batch
    /// continues; the return value is the total error count so far.
    pub fn run_batch(&mut self, plans: &[CommandPlan]) -> u32 {
        for plan in plans {
            info!("executing command: {}", plan.input);
            match recover::run_guarded(|| self.run_command(plan)) {
                Ok(Ok(())) => info!("command completed: {}", plan.input),
                Ok(Err(e)) => {
                    self.batch_errors += 1;
                    error!("command failed: {}: {e}", plan.input);
                }
                Err(fault) => {
                    self.batch_errors += 1;
                    error!("command {} interrupted by {fault}", plan.input);
                    self.recover_after_fault();
                }
            }
        }
        self.batch_errors
    }

    /// Release the shared config reference. Fatal if it fails.
    pub fn shutdown(mut self) -> Result<(), HarnessError> {
        self.config.release()?;
        Ok(())
    }

    // ── Command lifecycle ───────────────────────────────────────────

    fn run_command(&mut self, plan: &CommandPlan) -> Result<(), CommandError> {
        let catalog = CommandCatalog::for_family(self.arch.family());
        let (name, args) = split_command_args(&plan.input);
        let cmd = catalog
            .lookup(&plan.input)
            .ok_or_else(|| ValidationError::UnknownCommand { name: name.into() })?;

        if cmd.capability == Capability::NotImplemented {
            return Err(ValidationError::NotImplemented { name: name.into() }.into());
        }

        self.request = InjectRequest::empty();
        self.request.command = cmd.code;
        self.request.pid = plan.pid.unwrap_or(std::process::id() as i32);
        if plan.no_invoke {
            self.request.flags |= FLAG_NO_INVOKE;
        }
        if plan.check_bits {
            self.request.flags |= FLAG_CHECK_BITS;
        }
        match plan.quiesce {
            QuiesceMode::Pause => self.request.flags |= FLAG_QUIESCE_PAUSE,
            QuiesceMode::Offline => self.request.flags |= FLAG_QUIESCE_OFFLINE,
            QuiesceMode::None => {}
        }

        self.apply_address_args(cmd, name, &args)?;

        let result = self
            .pre_test(plan, cmd)
            .and_then(|()| self.execute(cmd));

        // Cleanup always runs, even for a failed preparation.
        match result {
            Ok(()) => self.post_test(),
            Err(e) => {
                if let Err(cleanup) = self.post_test() {
                    warn!("post-test cleanup failed: {cleanup}");
                }
                Err(e)
            }
        }
    }

    fn apply_address_args(
        &mut self,
        cmd: &CommandDescriptor,
        name: &str,
        args: &[&str],
    ) -> Result<(), CommandError> {
        let addr = match args.first() {
            Some(raw) => Some(parse_numeric(raw).ok_or_else(|| ValidationError::BadArgument {
                name: name.into(),
                arg: (*raw).into(),
            })?),
            None => None,
        };

        if cmd.target.requires_addr() {
            let addr = addr.ok_or_else(|| ValidationError::AddressRequired { name: name.into() })?;
            self.request.target_addr = addr;
            // A second argument on a user-virtual command names the owning
            // process.
            if cmd.target == crate::catalog::TargetKind::ExplicitUserVirtual {
                if let Some(raw) = args.get(1) {
                    let pid = parse_numeric(raw).ok_or_else(|| ValidationError::BadArgument {
                        name: name.into(),
                        arg: (*raw).into(),
                    })?;
                    self.request.pid = pid as i32;
                }
            }
        } else if let Some(addr) = addr {
            // An address on a buffer-owned command asks the driver to bind
            // the buffer to that physical page.
            let page = page_size() as u64;
            if addr % page != 0 {
                return Err(ValidationError::MisalignedAddress { addr }.into());
            }
            self.request.target_addr = addr;
            self.request.flags |= FLAG_BOUND_MEM;
        }
        Ok(())
    }

    fn pre_test(&mut self, plan: &CommandPlan, cmd: &CommandDescriptor) -> Result<(), CommandError> {
        self.state = LifecycleState::PreparingBuffers;

        if cmd.protection != ProtectionClass::Bus {
            let spec = PatternSpec {
                explicit: plan.xor_pattern,
                random: plan.random_pattern,
                check_bits: plan.check_bits,
            };
            self.request.xor_pattern =
                pattern::resolve(&spec, cmd, &mut self.rng, &self.opts.parity_policy);
        }
        self.request.corrupt_offset = plan.corrupt_offset.unwrap_or(cmd.corrupt_offset);
        self.request.access_offset = plan.access_offset.unwrap_or(cmd.access_offset);

        if cmd.low_impact {
            self.buffer = None;
        } else {
            let buffer = Arc::new(DataBuffer::alloc(MIN_DATABUF_SIZE)?);
            self.request.buf_base = buffer.base();
            self.request.buf_size = buffer.size() as u32;
            if !self.request.has_flag(FLAG_BOUND_MEM) && self.request.target_addr == 0 {
                self.request.target_addr = if cmd.access == AccessClass::Fetch {
                    buffer.instr_half()
                } else {
                    buffer.data_half()
                };
            }
            self.buffer = Some(buffer);
        }

        self.request.thread_count = cmd.thread_count();
        let mut bindings = plan.bindings.clone();
        bindings.resize(MAX_THREADS, BindingCriterion::Default);

        self.arch.pre_test(cmd, &mut self.request, &mut bindings)?;

        let nthreads = self.request.thread_count.min(MAX_THREADS as u32);
        if nthreads > 1
            && (self.request.has_flag(FLAG_QUIESCE_PAUSE)
                || self.request.has_flag(FLAG_QUIESCE_OFFLINE))
        {
            return Err(ValidationError::QuiesceWithThreads.into());
        }
        if (self.cpus.len() as u32) < nthreads {
            return Err(ValidationError::NotEnoughCpus {
                need: nthreads,
                have: self.cpus.len() as u32,
            }
            .into());
        }

        self.bind_threads(cmd, &bindings[..nthreads as usize])?;
        self.state = LifecycleState::ThreadsBound;

        // Physically bind the primary thread; workers bind themselves on
        // startup.
        if self.opts.bind_os_threads {
            if let Some(handle) = self.contexts[0].cpu {
                bind_current_thread(self.cpus.get(handle).id)?;
                self.contexts[0].bound = true;
            }
        }
        Ok(())
    }

    fn bind_threads(
        &mut self,
        cmd: &CommandDescriptor,
        bindings: &[BindingCriterion],
    ) -> Result<(), CommandError> {
        self.cpus.reset_chosen();
        let (data_buf, instr_buf) = match &self.buffer {
            Some(b) => (b.data_half(), b.instr_half()),
            None => (0, 0),
        };
        let request_snapshot = self.request.clone();

        // A primary thread that is already physically bound keeps its CPU
        // as long as no criterion was specified.
        let retained = if bindings.first() == Some(&BindingCriterion::Default)
            && self.contexts[0].bound
        {
            self.contexts[0].cpu
        } else {
            None
        };

        let mut chosen: Vec<CpuHandle> = Vec::with_capacity(bindings.len());
        {
            let pending = PendingCommand {
                cmd,
                request: &request_snapshot,
                data_buf,
                instr_buf,
            };
            let mut binder = TopologyBinder::new(&mut self.cpus, self.arch, &self.translator);
            for (thread_no, criterion) in bindings.iter().enumerate() {
                if thread_no == 0 {
                    if let Some(handle) = retained {
                        binder.retain(0, handle);
                        chosen.push(handle);
                        continue;
                    }
                }
                chosen.push(binder.select(thread_no, *criterion, Some(&pending))?);
            }
        }

        for (thread_no, handle) in chosen.into_iter().enumerate() {
            let cpu_id = self.cpus.get(handle).id;
            let delay = self.calibrate_thread(cpu_id)?;
            self.request.thread_cpu[thread_no] = cpu_id as i32;
            let ctx = &mut self.contexts[thread_no];
            ctx.cpu = Some(handle);
            ctx.data_buf = data_buf;
            ctx.instr_buf = instr_buf;
            ctx.delay = delay;
            ctx.sync = None;
            debug!("thread {thread_no}: cpu {cpu_id}, {} loops/us", delay.loops_per_us());
        }
        Ok(())
    }

    /// Calibrate the delay factor on the thread's target CPU, bound
    /// temporarily so the measurement reflects that CPU's clock.
    fn calibrate_thread(&self, cpu_id: u32) -> Result<DelayLoop, CommandError> {
        if self.opts.bind_os_threads {
            bind_current_thread(cpu_id)?;
            let delay = DelayLoop::calibrate();
            unbind_current_thread()?;
            Ok(delay)
        } else {
            Ok(DelayLoop::calibrate())
        }
    }

    fn execute(&mut self, cmd: &CommandDescriptor) -> Result<(), CommandError> {
        self.state = LifecycleState::Executing;
        debug!(
            "execute {}: xor={:#x} c_offset={:#x} a_offset={:#x} threads={}",
            cmd.name,
            self.request.xor_pattern,
            self.request.corrupt_offset,
            self.request.access_offset,
            self.request.thread_count
        );

        // The fault may make further logging unreliable; push buffered
        // diagnostics out before invoking it.
        log::logger().flush();
        let _ = io::stdout().flush();
        let _ = io::stderr().flush();

        match cmd.capability {
            Capability::EnableErr => self.gateway.enable_errors(&self.request)?,
            Capability::FlushCache => self.gateway.flush_cache(&self.request)?,
            Capability::KernelErr => self.gateway.inject(&self.request)?,
            Capability::IoErr => self.run_io_err(cmd)?,
            Capability::UserErr => self.run_user_err(cmd)?,
            Capability::UserWritebackErr => self.run_user_wb()?,
            Capability::UserCopybackErr => self.run_copyback(cmd)?,
            Capability::NotImplemented => {
                return Err(ValidationError::NotImplemented {
                    name: cmd.name.into(),
                }
                .into())
            }
        }
        Ok(())
    }

    fn post_test(&mut self) -> Result<(), CommandError> {
        self.state = LifecycleState::PostTest;
        if !self.opts.post_test_sleep.is_zero() {
            debug!("settling for {:?}", self.opts.post_test_sleep);
            thread::sleep(self.opts.post_test_sleep);
        }

        for ctx in &mut self.contexts {
            ctx.reset();
        }
        // Unmap the data buffer.
        self.buffer = None;

        if self.request.has_flag(FLAG_BOUND_MEM) {
            self.gateway.mem_request(&MemOp::ReleasePhys {
                paddr: self.request.target_addr,
            })?;
        }
        self.state = LifecycleState::Idle;
        Ok(())
    }

    fn recover_after_fault(&mut self) {
        self.buffer = None;
        for ctx in &mut self.contexts {
            ctx.reset();
        }
        self.state = LifecycleState::Idle;
    }

    // ── Capability handlers ─────────────────────────────────────────

    fn owned_buffer(&self) -> Result<Arc<DataBuffer>, CommandError> {
        self.buffer.clone().ok_or_else(|| {
            ValidationError::Unsupported {
                reason: "command requires an injection buffer".into(),
            }
            .into()
        })
    }

    /// Single-thread user test: touch, inject, access, short delay.
    fn run_user_err(&mut self, cmd: &CommandDescriptor) -> Result<(), CommandError> {
        let access_va = self.request.target_addr + u64::from(self.request.access_offset);
        let buffer = self.buffer.clone();
        let access_off = buffer.as_ref().and_then(|b| b.offset_of(access_va));

        // Touch the target first so the invocation access does not take an
        // unrelated MMU miss. Only addresses the injector owns are touched.
        if let (Some(buffer), Some(off)) = (&buffer, access_off) {
            buffer.touch_line(off, CACHE_LINE_SIZE as usize);
        }

        self.gateway.inject(&self.request)?;

        if self.request.has_flag(FLAG_NO_INVOKE) {
            debug!("{}: not invoking the error", cmd.name);
            return Ok(());
        }

        if let (Some(buffer), Some(off)) = (&buffer, access_off) {
            match cmd.access {
                // The store merges with the corrupted line.
                AccessClass::Store => buffer.store(off, 0xff),
                AccessClass::BlockLoad => buffer.touch_line(off, CACHE_LINE_SIZE as usize),
                AccessClass::Load | AccessClass::Fetch => {
                    buffer.touch(off);
                }
            }
        } else {
            debug!("{}: target is not injector-owned, skipping local access", cmd.name);
        }

        // Give the error time to land here rather than in unrelated code.
        self.contexts[0].delay.delay_us(10);
        Ok(())
    }

    /// User write-back test: inject, then evict the dirty line.
    fn run_user_wb(&mut self) -> Result<(), CommandError> {
        self.gateway.inject(&self.request)?;
        if !self.request.has_flag(FLAG_NO_INVOKE) {
            self.arch.flush_cache(&self.flush_region);
        }
        Ok(())
    }

    /// DMA buffer test: inject, dirty the page, write it back.
    fn run_io_err(&mut self, cmd: &CommandDescriptor) -> Result<(), CommandError> {
        let buffer = self.owned_buffer()?;
        let page = page_size();

        // Dirty-marking access must not trip the injected error: displace
        // it to the upper half of the page when the access offset lands in
        // the lower half.
        let a_off = self.request.access_offset as usize;
        let dirty_off = if a_off < page / 2 {
            page / 2 + page / 4
        } else {
            0
        };

        self.gateway.inject(&self.request)?;

        let byte = buffer.touch(dirty_off);
        buffer.store(dirty_off, byte);

        if self.request.has_flag(FLAG_NO_INVOKE) {
            debug!("{}: not invoking the error", cmd.name);
            return Ok(());
        }

        if let Err(e) = buffer.msync() {
            // A correctable target should survive the write-back; anything
            // else is allowed to kill the sync.
            if cmd.protection == ProtectionClass::Correctable {
                return Err(e.into());
            }
            debug!("{}: msync failed after injection: {e}", cmd.name);
        }
        Ok(())
    }

    /// Two-thread copyback test. Thread 0 (this thread) consumes; thread 1
    /// produces. The shared cell sequences inject and invoke.
    fn run_copyback(&mut self, cmd: &CommandDescriptor) -> Result<(), CommandError> {
        if self.request.thread_count != 2 {
            return Err(ValidationError::Unsupported {
                reason: format!(
                    "copyback command needs 2 threads, got {}",
                    self.request.thread_count
                ),
            }
            .into());
        }
        let buffer = self.owned_buffer()?;
        let timeout = self.opts.sync_timeout_us;

        let cell = SyncCell::new();
        self.contexts[0].sync = Some(cell.clone());
        self.contexts[1].sync = Some(cell.clone());

        let producer_cpu = self.contexts[1]
            .cpu
            .map(|h| self.cpus.get(h).id)
            .ok_or_else(|| ValidationError::Unsupported {
                reason: "producer thread has no cpu binding".into(),
            })?;

        let job = ProducerJob {
            gateway: self.gateway.clone(),
            request: self.request.clone(),
            channel: SyncChannel::new(cell.clone(), self.contexts[1].delay),
            cpu_id: producer_cpu,
            bind: self.opts.bind_os_threads,
            timeout_us: timeout,
            writeback: cmd.writeback,
            family: self.arch.family(),
            flush_region: self.flush_region.clone(),
        };
        let producer = thread::Builder::new()
            .name("faultline-producer".into())
            .spawn(move || producer_main(job))
            .map_err(CommandError::Spawn)?;

        let consumer = SyncChannel::new(cell, self.contexts[0].delay);
        let access_va = self.request.target_addr + u64::from(self.request.access_offset);
        let access_off = buffer.offset_of(access_va);

        // Pre-access to keep MMU misses away from the invocation.
        if let Some(off) = access_off {
            buffer.touch_line(off, CACHE_LINE_SIZE as usize);
        }

        // Set the producer loose to inject.
        consumer.signal(SyncState::GoInject);

        if let Err(e) = consumer.wait_for(SyncState::Injected, timeout) {
            // The failed wait has already aborted the cell; the producer
            // will observe it and exit.
            join_producer(producer)?;
            return Err(e.into());
        }

        if !self.request.has_flag(FLAG_NO_INVOKE) {
            if cmd.writeback {
                self.arch.flush_cache(&self.flush_region);
            } else if let Some(off) = access_off {
                buffer.touch(off);
            }
        }
        consumer.signal(SyncState::Invoked);

        // Let the error land before tearing anything down.
        self.contexts[0].delay.delay_us(10);

        join_producer(producer)?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Producer thread
// ═══════════════════════════════════════════════════════════════════════

struct ProducerJob {
    gateway: Arc<dyn DriverGateway>,
    request: InjectRequest,
    channel: SyncChannel,
    cpu_id: u32,
    bind: bool,
    timeout_us: u64,
    writeback: bool,
    family: CpuFamily,
    flush_region: Arc<DataBuffer>,
}

/// Producer body: bind, wait for the go-ahead, inject, hand the error to
/// the consumer, wait for the invocation (or an abort) and exit.
fn producer_main(job: ProducerJob) -> Result<(), CommandError> {
    if job.bind {
        if let Err(e) = bind_current_thread(job.cpu_id) {
            job.channel.cell().abort();
            return Err(e.into());
        }
    }
    debug!("producer: bound to cpu {}", job.cpu_id);

    job.channel.wait_for(SyncState::GoInject, job.timeout_us)?;

    if let Err(e) = job.gateway.inject(&job.request) {
        error!("producer: injection failed on cpu {}: {e}", job.cpu_id);
        job.channel.cell().abort();
        return Err(e.into());
    }

    // Write-back targets leave the producer holding the dirty line; push it
    // to memory before releasing the consumer.
    if job.writeback {
        arch_for(job.family).flush_cache(&job.flush_region);
    }

    job.channel.signal(SyncState::Injected);

    // An abort here still means an orderly exit; the consumer owns the
    // error report.
    match job.channel.wait(SyncState::Invoked, job.timeout_us) {
        WaitOutcome::Ok | WaitOutcome::Aborted => Ok(()),
        WaitOutcome::TimedOut => Err(SyncError::Timeout {
            expected: SyncState::Invoked,
            waited_us: job.timeout_us,
        }
        .into()),
    }
}

fn join_producer(
    handle: thread::JoinHandle<Result<(), CommandError>>,
) -> Result<(), CommandError> {
    match handle.join() {
        Ok(result) => result,
        // Keep fault-event semantics: an unwinding producer re-raises on
        // the orchestrating thread where the recovery checkpoint lives.
        Err(payload) => std::panic::resume_unwind(payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faultline_gateway::sim::SimGateway;
    use faultline_gateway::KernelVars;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Fixture {
        sim: Arc<SimGateway>,
        dir: tempfile::TempDir,
        ncpus: u32,
    }

    impl Fixture {
        fn new(sim: SimGateway) -> Self {
            let sim = Arc::new(sim);
            sim.set_kvars(KernelVars {
                debug_level: 1,
                error_reporting: 1,
                ce_throttle: 8,
            });
            let ncpus = sim.system_info().unwrap().ncpus_online;
            Self {
                sim,
                dir: tempfile::tempdir().unwrap(),
                ncpus,
            }
        }

        fn heron(n: usize) -> Self {
            Self::new(SimGateway::uniform(n, CpuFamily::Heron))
        }

        fn options(&self) -> HarnessOptions {
            HarnessOptions {
                config_path: self.dir.path().join("faultline.conf"),
                bind_os_threads: false,
                expected_online: Some(self.ncpus),
                sync_timeout_us: 2_000_000,
                ..HarnessOptions::default()
            }
        }

        fn orchestrator(&self) -> TestOrchestrator {
            TestOrchestrator::new(self.sim.clone(), self.options()).unwrap()
        }
    }

    #[test]
    fn init_sets_debug_level_and_acquires_config() {
        let fx = Fixture::heron(2);
        let orch = fx.orchestrator();
        assert_eq!(orch.state(), LifecycleState::Idle);
        assert!(fx.dir.path().join("faultline.conf").exists());
        orch.shutdown().unwrap();
        assert!(!fx.dir.path().join("faultline.conf").exists());
    }

    #[test]
    fn single_thread_user_command_injects_through_the_gateway() {
        let fx = Fixture::heron(2);
        let mut orch = fx.orchestrator();
        let errs = orch.run_batch(&[CommandPlan::new("udce")]);
        assert_eq!(errs, 0);

        let injected = fx.sim.injected();
        assert_eq!(injected.len(), 1);
        let req = &injected[0];
        assert_eq!(req.xor_pattern, 0x1); // catalog default
        assert_ne!(req.buf_base, 0);
        assert_eq!(req.thread_count, 1);
        assert_eq!(req.thread_cpu[0], 0); // lowest id wins
        assert_eq!(req.target_addr, req.buf_base); // load access, data half
        assert_eq!(orch.state(), LifecycleState::Idle);
        orch.shutdown().unwrap();
    }

    #[test]
    fn fetch_command_targets_the_instruction_half() {
        let fx = Fixture::heron(2);
        let mut orch = fx.orchestrator();
        assert_eq!(orch.run_batch(&[CommandPlan::new("uice")]), 0);
        let req = &fx.sim.injected()[0];
        assert_eq!(req.target_addr, req.buf_base + u64::from(req.buf_size) / 2);
        orch.shutdown().unwrap();
    }

    #[test]
    fn plan_overrides_beat_catalog_defaults() {
        let fx = Fixture::heron(2);
        let mut orch = fx.orchestrator();
        let mut plan = CommandPlan::new("udce");
        plan.xor_pattern = Some(0x80);
        plan.corrupt_offset = Some(0x10);
        plan.access_offset = Some(0x20);
        assert_eq!(orch.run_batch(&[plan]), 0);
        let req = &fx.sim.injected()[0];
        assert_eq!(req.xor_pattern, 0x80);
        assert_eq!(req.corrupt_offset, 0x10);
        assert_eq!(req.access_offset, 0x20);
        orch.shutdown().unwrap();
    }

    #[test]
    fn low_impact_commands_skip_buffer_allocation() {
        let fx = Fixture::heron(2);
        let mut orch = fx.orchestrator();
        assert_eq!(orch.run_batch(&[CommandPlan::new("enable")]), 0);
        assert_eq!(fx.sim.enabled().len(), 1);
        assert_eq!(fx.sim.enabled()[0].buf_base, 0);
        assert!(fx.sim.injected().is_empty());
        orch.shutdown().unwrap();
    }

    #[test]
    fn copyback_runs_producer_and_consumer_to_completion() {
        let fx = Fixture::heron(2);
        let mut orch = fx.orchestrator();
        assert_eq!(orch.run_batch(&[CommandPlan::new("udcp")]), 0);

        let injected = fx.sim.injected();
        assert_eq!(injected.len(), 1);
        let req = &injected[0];
        assert_eq!(req.thread_count, 2);
        assert_eq!(req.thread_cpu[0], 0);
        assert_eq!(req.thread_cpu[1], 1);
        orch.shutdown().unwrap();
    }

    #[test]
    fn copyback_needs_two_cpus() {
        let fx = Fixture::heron(1);
        let mut orch = fx.orchestrator();
        assert_eq!(orch.run_batch(&[CommandPlan::new("udcp")]), 1);
        assert!(fx.sim.injected().is_empty());
        orch.shutdown().unwrap();
    }

    #[test]
    fn quiesce_conflicts_with_multi_thread_commands() {
        let fx = Fixture::heron(2);
        let mut orch = fx.orchestrator();
        let mut plan = CommandPlan::new("udcp");
        plan.quiesce = QuiesceMode::Pause;
        assert_eq!(orch.run_batch(&[plan]), 1);
        assert!(fx.sim.injected().is_empty());
        orch.shutdown().unwrap();
    }

    #[test]
    fn batch_continues_past_failed_commands() {
        let fx = Fixture::heron(2);
        let mut orch = fx.orchestrator();
        let plans = vec![
            CommandPlan::new("nonsense"),
            CommandPlan::new("mstress"), // catalogued but not implemented
            CommandPlan::new("pdce"),    // missing required address
            CommandPlan::new("udce"),
        ];
        assert_eq!(orch.run_batch(&plans), 3);
        assert_eq!(fx.sim.injected().len(), 1); // only udce ran
        orch.shutdown().unwrap();
    }

    #[test]
    fn driver_rejection_fails_the_command_but_not_the_batch() {
        let fx = Fixture::heron(2);
        let mut orch = fx.orchestrator();
        fx.sim.set_fail_inject(true);
        assert_eq!(orch.run_batch(&[CommandPlan::new("udce")]), 1);

        fx.sim.set_fail_inject(false);
        assert_eq!(orch.run_batch(&[CommandPlan::new("udce")]), 1); // counter is cumulative
        assert_eq!(fx.sim.injected().len(), 1);
        orch.shutdown().unwrap();
    }

    #[test]
    fn explicit_physical_command_passes_the_address_through() {
        let fx = Fixture::heron(2);
        let mut orch = fx.orchestrator();
        assert_eq!(orch.run_batch(&[CommandPlan::new("pdce=0x2_0000_0000")]), 1);
        // underscores are not valid in arguments
        assert!(fx.sim.injected().is_empty());

        assert_eq!(orch.run_batch(&[CommandPlan::new("pdce=0x200000000")]), 1);
        let injected = fx.sim.injected();
        assert_eq!(injected.len(), 1);
        assert_eq!(injected[0].target_addr, 0x2_0000_0000);
        assert_eq!(injected[0].buf_base, 0);
        orch.shutdown().unwrap();
    }

    #[test]
    fn bound_memory_address_is_released_after_the_command() {
        let fx = Fixture::heron(2);
        let mut orch = fx.orchestrator();
        assert_eq!(orch.run_batch(&[CommandPlan::new("udce=0x4000")]), 0);
        let req = &fx.sim.injected()[0];
        assert!(req.has_flag(FLAG_BOUND_MEM));
        assert_eq!(req.target_addr, 0x4000);
        assert_eq!(fx.sim.released_phys(), vec![0x4000]);
        orch.shutdown().unwrap();
    }

    #[test]
    fn misaligned_bound_memory_address_is_rejected() {
        let fx = Fixture::heron(2);
        let mut orch = fx.orchestrator();
        assert_eq!(orch.run_batch(&[CommandPlan::new("udce=0x4001")]), 1);
        assert!(fx.sim.injected().is_empty());
        orch.shutdown().unwrap();
    }

    #[test]
    fn explicit_binding_criteria_are_honored() {
        let fx = Fixture::heron(4);
        let mut orch = fx.orchestrator();
        let mut plan = CommandPlan::new("udce");
        plan.bindings = vec![BindingCriterion::ByCpuId(3)];
        assert_eq!(orch.run_batch(&[plan]), 0);
        assert_eq!(fx.sim.injected()[0].thread_cpu[0], 3);
        orch.shutdown().unwrap();
    }

    // A gateway that raises a fault event on the first injection, as the
    // real driver effectively does when the injected error is consumed
    // before control returns.
    struct TrippingGateway {
        inner: Arc<SimGateway>,
        tripped: AtomicBool,
    }

    impl DriverGateway for TrippingGateway {
        fn set_debug_level(&self, level: u32) -> Result<(), DriverError> {
            self.inner.set_debug_level(level)
        }
        fn system_info(&self) -> Result<faultline_gateway::SystemInfo, DriverError> {
            self.inner.system_info()
        }
        fn cpu_info(&self, cpu_id: u32) -> Result<faultline_gateway::CpuInfo, DriverError> {
            self.inner.cpu_info(cpu_id)
        }
        fn mem_request(&self, op: &MemOp) -> Result<u64, DriverError> {
            self.inner.mem_request(op)
        }
        fn inject(&self, req: &InjectRequest) -> Result<(), DriverError> {
            if !self.tripped.swap(true, Ordering::SeqCst) {
                crate::recover::raise(crate::recover::FaultEvent::new(
                    crate::recover::FaultKind::BusError,
                    "injected error consumed during injection",
                ));
            }
            self.inner.inject(req)
        }
        fn enable_errors(&self, req: &InjectRequest) -> Result<(), DriverError> {
            self.inner.enable_errors(req)
        }
        fn flush_cache(&self, req: &InjectRequest) -> Result<(), DriverError> {
            self.inner.flush_cache(req)
        }
        fn kernel_vars(&self, vars: &mut KernelVars, write: bool) -> Result<(), DriverError> {
            self.inner.kernel_vars(vars, write)
        }
    }

    #[test]
    fn fault_signal_is_recovered_and_the_batch_continues() {
        let fx = Fixture::heron(2);
        let gateway = Arc::new(TrippingGateway {
            inner: fx.sim.clone(),
            tripped: AtomicBool::new(false),
        });
        let mut orch = TestOrchestrator::new(gateway, fx.options()).unwrap();

        let errs = orch.run_batch(&[CommandPlan::new("udce"), CommandPlan::new("udce")]);
        assert_eq!(errs, 1);
        assert_eq!(orch.state(), LifecycleState::Idle);
        assert_eq!(fx.sim.injected().len(), 1); // second command succeeded
        orch.shutdown().unwrap();
    }
}
