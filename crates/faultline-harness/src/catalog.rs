//! Command descriptors and classification.
//!
//! A [`CommandDescriptor`] is the static contract for one error-injection
//! command: its numeric code, which handler runs it, how it is classified,
//! the bit masks its corruption pattern must stay inside, and its default
//! offsets. The full per-chip catalogs live outside this crate; the tables
//! here are the representative set the harness is tested against.
//!
//! Command strings may carry arguments after an `'='` (`pdce=0x40001000`),
//! so lookup compares names only up to the first `'='`.

use faultline_gateway::CpuFamily;

/// Handler capability tag. Selects the execution routine in the
/// orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Program error-detection registers, no injection.
    EnableErr,
    /// Driver-side cache maintenance, no injection.
    FlushCache,
    /// DMA buffer corruption invoked by syncing the buffer out.
    IoErr,
    /// Driver injects and invokes entirely in kernel context.
    KernelErr,
    /// Catalog entry exists but no test routine is defined.
    NotImplemented,
    /// Two-thread producer/consumer copyback test.
    UserCopybackErr,
    /// Single-thread user-mode inject-then-access test.
    UserErr,
    /// User-mode corruption invoked by a displacement cache flush.
    UserWritebackErr,
}

/// Error-detection scheme protecting the corrupted structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionClass {
    Parity,
    Correctable,
    Uncorrectable,
    /// Bus/interconnect protocol errors; no meaningful xor pattern.
    Bus,
}

/// How the invocation access reaches the corrupted data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessClass {
    Load,
    Store,
    /// Instruction fetch; the target is the instruction buffer.
    Fetch,
    BlockLoad,
}

/// What kind of address the command corrupts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// Caller supplies a physical address.
    ExplicitPhysical,
    /// Caller supplies a real address (families with the indirection layer).
    ExplicitReal,
    /// Caller supplies a kernel virtual address.
    ExplicitKernelVirtual,
    /// Caller supplies a user virtual address (optionally a foreign pid).
    ExplicitUserVirtual,
    /// The harness allocates and targets its own data/instruction buffer.
    Buffer,
}

impl TargetKind {
    /// Whether the command string must carry an address argument.
    pub fn requires_addr(self) -> bool {
        !matches!(self, TargetKind::Buffer)
    }
}

/// Static descriptor for one command.
#[derive(Debug, Clone, Copy)]
pub struct CommandDescriptor {
    /// Command name as typed on the command line.
    pub name: &'static str,
    /// Numeric code shared with the driver.
    pub code: u64,
    pub capability: Capability,
    pub protection: ProtectionClass,
    pub access: AccessClass,
    pub target: TargetKind,
    /// Low-impact utility command: no data buffer is allocated.
    pub low_impact: bool,
    /// Invocation goes through a cache write-back, not a direct access.
    pub writeback: bool,
    /// Valid data-bit positions for corruption patterns.
    pub data_mask: u64,
    /// Valid check-bit positions.
    pub check_mask: u64,
    /// Default data-bit xor pattern.
    pub data_xor: u64,
    /// Default check-bit xor pattern.
    pub check_xor: u64,
    /// Default corruption byte offset.
    pub corrupt_offset: u32,
    /// Default access byte offset.
    pub access_offset: u32,
    /// One-line usage text.
    pub usage: &'static str,
}

impl CommandDescriptor {
    /// Threads needed to run this command.
    pub fn thread_count(&self) -> u32 {
        match self.capability {
            Capability::UserCopybackErr => 2,
            _ => 1,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Catalogs
// ═══════════════════════════════════════════════════════════════════════

const DATA64: u64 = u64::MAX;
const CHECK8: u64 = 0xff;

macro_rules! cmd {
    ($name:literal, $code:literal, $cap:ident, $prot:ident, $acc:ident,
     $target:ident, low_impact: $li:literal, writeback: $wb:literal,
     xor: $xor:literal, usage: $usage:literal) => {
        CommandDescriptor {
            name: $name,
            code: $code,
            capability: Capability::$cap,
            protection: ProtectionClass::$prot,
            access: AccessClass::$acc,
            target: TargetKind::$target,
            low_impact: $li,
            writeback: $wb,
            data_mask: DATA64,
            check_mask: CHECK8,
            data_xor: $xor,
            check_xor: 0x1,
            corrupt_offset: 0,
            access_offset: 0,
            usage: $usage,
        }
    };
}

/// Commands shared by every supported family.
const COMMON_COMMANDS: &[CommandDescriptor] = &[
    cmd!("kdce", 0x1001, KernelErr, Correctable, Load, Buffer,
        low_impact: false, writeback: false, xor: 0x1,
        usage: "kernel data correctable error"),
    cmd!("kdue", 0x1002, KernelErr, Uncorrectable, Load, Buffer,
        low_impact: false, writeback: false, xor: 0x3,
        usage: "kernel data uncorrectable error"),
    cmd!("kdpe", 0x1003, KernelErr, Parity, Load, Buffer,
        low_impact: false, writeback: false, xor: 0x1,
        usage: "kernel data parity error"),
    cmd!("udce", 0x2001, UserErr, Correctable, Load, Buffer,
        low_impact: false, writeback: false, xor: 0x1,
        usage: "user data correctable error, load access"),
    cmd!("udue", 0x2002, UserErr, Uncorrectable, Load, Buffer,
        low_impact: false, writeback: false, xor: 0x3,
        usage: "user data uncorrectable error, load access"),
    cmd!("usce", 0x2003, UserErr, Correctable, Store, Buffer,
        low_impact: false, writeback: false, xor: 0x1,
        usage: "user data correctable error, store-merge access"),
    cmd!("ubce", 0x2004, UserErr, Correctable, BlockLoad, Buffer,
        low_impact: false, writeback: false, xor: 0x1,
        usage: "user data correctable error, block-load access"),
    cmd!("uice", 0x2005, UserErr, Correctable, Fetch, Buffer,
        low_impact: false, writeback: false, xor: 0x1,
        usage: "user instruction correctable error"),
    cmd!("udcp", 0x2101, UserCopybackErr, Correctable, Load, Buffer,
        low_impact: false, writeback: false, xor: 0x1,
        usage: "user copyback correctable error (producer/consumer)"),
    cmd!("uwcp", 0x2102, UserCopybackErr, Correctable, Load, Buffer,
        low_impact: false, writeback: true, xor: 0x1,
        usage: "user copyback error invoked by write-back"),
    cmd!("uwbce", 0x2201, UserWritebackErr, Correctable, Load, Buffer,
        low_impact: false, writeback: true, xor: 0x1,
        usage: "user write-back correctable error"),
    cmd!("iodce", 0x3001, IoErr, Correctable, Load, Buffer,
        low_impact: false, writeback: false, xor: 0x1,
        usage: "dma buffer correctable error"),
    cmd!("pdce", 0x4001, KernelErr, Correctable, Load, ExplicitPhysical,
        low_impact: true, writeback: false, xor: 0x1,
        usage: "pdce=<paddr> correctable error at a physical address"),
    cmd!("kvce", 0x4002, KernelErr, Correctable, Load, ExplicitKernelVirtual,
        low_impact: true, writeback: false, xor: 0x1,
        usage: "kvce=<kvaddr> correctable error at a kernel virtual address"),
    cmd!("uvce", 0x4003, UserErr, Correctable, Load, ExplicitUserVirtual,
        low_impact: true, writeback: false, xor: 0x1,
        usage: "uvce=<uvaddr>[,<pid>] correctable error at a user virtual address"),
    cmd!("enable", 0x5001, EnableErr, Bus, Load, Buffer,
        low_impact: true, writeback: false, xor: 0x0,
        usage: "program error-detection registers"),
    cmd!("flushl2", 0x5002, FlushCache, Bus, Load, Buffer,
        low_impact: true, writeback: false, xor: 0x0,
        usage: "flush the L2 cache"),
    cmd!("mstress", 0x5003, NotImplemented, Bus, Load, Buffer,
        low_impact: true, writeback: false, xor: 0x0,
        usage: "memory stress pattern (unimplemented)"),
];

/// Kestrel additions: real-address commands only exist behind the
/// indirection layer.
const KESTREL_COMMANDS: &[CommandDescriptor] = &[
    cmd!("rdce", 0x4101, KernelErr, Correctable, Load, ExplicitReal,
        low_impact: true, writeback: false, xor: 0x1,
        usage: "rdce=<raddr> correctable error at a real address"),
    cmd!("rdue", 0x4102, KernelErr, Uncorrectable, Load, ExplicitReal,
        low_impact: true, writeback: false, xor: 0x3,
        usage: "rdue=<raddr> uncorrectable error at a real address"),
];

/// The command tables for one family.
#[derive(Debug, Clone, Copy)]
pub struct CommandCatalog {
    tables: [&'static [CommandDescriptor]; 2],
}

impl CommandCatalog {
    /// Catalog for `family`.
    pub fn for_family(family: CpuFamily) -> Self {
        let extra: &'static [CommandDescriptor] = match family {
            CpuFamily::Kestrel => KESTREL_COMMANDS,
            CpuFamily::Heron => &[],
        };
        Self {
            tables: [COMMON_COMMANDS, extra],
        }
    }

    /// All descriptors, common table first.
    pub fn iter(&self) -> impl Iterator<Item = &'static CommandDescriptor> {
        self.tables.into_iter().flatten()
    }

    /// Look up a command by its (possibly `=`-suffixed) name.
    pub fn lookup(&self, input: &str) -> Option<&'static CommandDescriptor> {
        self.iter().find(|c| cmd_name_eq(input, c.name))
    }
}

/// Compare a command-line token against a catalog name, stopping at `'='`.
fn cmd_name_eq(input: &str, name: &str) -> bool {
    let bare = input.split('=').next().unwrap_or(input);
    bare == name
}

/// Split `name=a,b,...` into the bare name and its numeric arguments.
pub fn split_command_args(input: &str) -> (&str, Vec<&str>) {
    match input.split_once('=') {
        Some((name, rest)) => (name, rest.split(',').collect()),
        None => (input, Vec::new()),
    }
}

/// Parse a decimal or `0x`-prefixed numeric argument.
pub fn parse_numeric(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_stops_at_equals() {
        let cat = CommandCatalog::for_family(CpuFamily::Heron);
        let cmd = cat.lookup("pdce=0x40001000").unwrap();
        assert_eq!(cmd.name, "pdce");
        assert_eq!(cmd.target, TargetKind::ExplicitPhysical);
    }

    #[test]
    fn real_address_commands_are_kestrel_only() {
        let kestrel = CommandCatalog::for_family(CpuFamily::Kestrel);
        let heron = CommandCatalog::for_family(CpuFamily::Heron);
        assert!(kestrel.lookup("rdce=0x1000").is_some());
        assert!(heron.lookup("rdce=0x1000").is_none());
    }

    #[test]
    fn copyback_commands_need_two_threads() {
        let cat = CommandCatalog::for_family(CpuFamily::Heron);
        assert_eq!(cat.lookup("udcp").unwrap().thread_count(), 2);
        assert_eq!(cat.lookup("udce").unwrap().thread_count(), 1);
    }

    #[test]
    fn codes_are_unique_per_catalog() {
        for family in [CpuFamily::Kestrel, CpuFamily::Heron] {
            let cat = CommandCatalog::for_family(family);
            let codes: Vec<u64> = cat.iter().map(|c| c.code).collect();
            let mut dedup = codes.clone();
            dedup.sort_unstable();
            dedup.dedup();
            assert_eq!(codes.len(), dedup.len(), "{family:?} has duplicate codes");
        }
    }

    #[test]
    fn split_and_parse_arguments() {
        let (name, args) = split_command_args("uvce=0x7fff0000,4242");
        assert_eq!(name, "uvce");
        assert_eq!(parse_numeric(args[0]), Some(0x7fff_0000));
        assert_eq!(parse_numeric(args[1]), Some(4242));

        let (name, args) = split_command_args("udce");
        assert_eq!(name, "udce");
        assert!(args.is_empty());
    }
}
