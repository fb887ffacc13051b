//! Corruption (xor) pattern resolution.
//!
//! A command's pattern comes from one of three sources, in priority order:
//! an explicit user value, a random selection validated against the
//! command's bit mask, or the catalog default. Whatever the source, the
//! final pattern is masked to the valid bit positions and run past the
//! bit-count heuristic.
//!
//! The heuristic is policy, not an invariant: some families produce
//! multi-bit correctable and single-bit uncorrectable errors on purpose, so
//! the per-class expectations are a table of log severities the caller can
//! swap out, never a hard failure.

use crate::catalog::{CommandDescriptor, ProtectionClass};
use log::{debug, warn};
use rand::RngCore;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

/// Retry bound for random bit selection inside the valid mask.
pub const MAX_RANDOM_ATTEMPTS: u32 = 64;

/// Where the pattern should come from.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatternSpec {
    /// Explicit user-supplied pattern; wins over everything.
    pub explicit: Option<u64>,
    /// Select random bits inside the command's mask.
    pub random: bool,
    /// Corrupt check bits rather than data bits.
    pub check_bits: bool,
}

/// Log severity of one heuristic observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warn,
    Debug,
    Silent,
}

/// Per-protection-class bit-count expectations.
///
/// `parity_even`: an even bit count defeats parity detection entirely.
/// `correctable_multi` / `uncorrectable_single`: unusual, but legitimate on
/// some families, so they default to `Debug`.
#[derive(Debug, Clone, Copy)]
pub struct ParityPolicy {
    pub parity_even: Severity,
    pub correctable_multi: Severity,
    pub uncorrectable_single: Severity,
}

impl Default for ParityPolicy {
    fn default() -> Self {
        Self {
            parity_even: Severity::Warn,
            correctable_multi: Severity::Debug,
            uncorrectable_single: Severity::Debug,
        }
    }
}

/// Derive a pattern RNG from a 64-bit seed.
pub fn rng_from_seed(seed: u64) -> ChaCha20Rng {
    let mut key = [0u8; 32];
    key[..8].copy_from_slice(&seed.to_le_bytes());
    ChaCha20Rng::from_seed(key)
}

/// Resolve the xor pattern for `cmd`.
pub fn resolve(
    spec: &PatternSpec,
    cmd: &CommandDescriptor,
    rng: &mut ChaCha20Rng,
    policy: &ParityPolicy,
) -> u64 {
    let mask = if spec.check_bits {
        cmd.check_mask
    } else {
        cmd.data_mask
    };
    let default_xor = if spec.check_bits {
        cmd.check_xor
    } else {
        cmd.data_xor
    };

    let mut pattern = if let Some(explicit) = spec.explicit {
        explicit
    } else if spec.random && default_xor != 0 {
        random_pattern(cmd, mask, rng).unwrap_or_else(|| {
            warn!("unable to generate a random xor pattern, using the default");
            default_xor
        })
    } else {
        if default_xor == 0 {
            // Nothing to corrupt and nothing to check.
            return 0;
        }
        default_xor
    };

    pattern &= mask;
    check_bit_count(cmd.protection, pattern, default_xor, policy);
    pattern
}

/// Pick one random bit inside `mask`; two distinct bits for uncorrectable
/// commands. `None` once the retry budget is exhausted.
fn random_pattern(cmd: &CommandDescriptor, mask: u64, rng: &mut ChaCha20Rng) -> Option<u64> {
    let first = random_masked_bit(mask, rng, None)?;
    let mut pattern = 1u64 << first;

    if cmd.protection == ProtectionClass::Uncorrectable {
        let second = random_masked_bit(mask, rng, Some(first))?;
        pattern |= 1u64 << second;
    }
    Some(pattern)
}

fn random_masked_bit(mask: u64, rng: &mut ChaCha20Rng, exclude: Option<u32>) -> Option<u32> {
    for _ in 0..MAX_RANDOM_ATTEMPTS {
        let shift = (rng.next_u64() % 64) as u32;
        if (mask >> shift) & 1 == 1 && Some(shift) != exclude {
            return Some(shift);
        }
    }
    None
}

fn check_bit_count(protection: ProtectionClass, pattern: u64, default_xor: u64, policy: &ParityPolicy) {
    let bits = pattern.count_ones();
    debug!("xor pattern {pattern:#x}: {bits} bit(s) set");

    if bits == 0 {
        if default_xor != 0 {
            warn!("no bits set in xor pattern {pattern:#x}");
        }
        return;
    }

    match protection {
        ProtectionClass::Parity if bits % 2 == 0 => emit(
            policy.parity_even,
            format_args!("even number of bits set in xor pattern {pattern:#x} for a parity case"),
        ),
        ProtectionClass::Correctable if bits > 1 => emit(
            policy.correctable_multi,
            format_args!("more than one bit set in xor pattern {pattern:#x} for a correctable case"),
        ),
        ProtectionClass::Uncorrectable if bits == 1 => emit(
            policy.uncorrectable_single,
            format_args!("only one bit set in xor pattern {pattern:#x} for an uncorrectable case"),
        ),
        _ => {}
    }
}

fn emit(severity: Severity, msg: std::fmt::Arguments<'_>) {
    match severity {
        Severity::Warn => warn!("{msg}"),
        Severity::Debug => debug!("{msg}"),
        Severity::Silent => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CommandCatalog;
    use faultline_gateway::CpuFamily;

    fn cmd(name: &str) -> &'static CommandDescriptor {
        CommandCatalog::for_family(CpuFamily::Heron)
            .lookup(name)
            .unwrap()
    }

    #[test]
    fn explicit_pattern_wins_and_is_masked() {
        let spec = PatternSpec {
            explicit: Some(0x8000_0000_0000_00ff),
            check_bits: true, // check mask is 0xff
            ..Default::default()
        };
        let mut rng = rng_from_seed(1);
        let p = resolve(&spec, cmd("udce"), &mut rng, &ParityPolicy::default());
        assert_eq!(p, 0xff);
    }

    #[test]
    fn default_pattern_used_without_overrides() {
        let spec = PatternSpec::default();
        let mut rng = rng_from_seed(1);
        assert_eq!(
            resolve(&spec, cmd("udue"), &mut rng, &ParityPolicy::default()),
            0x3
        );
    }

    #[test]
    fn random_correctable_sets_exactly_one_masked_bit() {
        let spec = PatternSpec {
            random: true,
            ..Default::default()
        };
        for seed in 0..32 {
            let mut rng = rng_from_seed(seed);
            let p = resolve(&spec, cmd("udce"), &mut rng, &ParityPolicy::default());
            assert_eq!(p.count_ones(), 1, "seed {seed} produced {p:#x}");
        }
    }

    #[test]
    fn random_uncorrectable_sets_two_distinct_bits() {
        let spec = PatternSpec {
            random: true,
            ..Default::default()
        };
        for seed in 0..32 {
            let mut rng = rng_from_seed(seed);
            let p = resolve(&spec, cmd("udue"), &mut rng, &ParityPolicy::default());
            assert_eq!(p.count_ones(), 2, "seed {seed} produced {p:#x}");
        }
    }

    #[test]
    fn random_is_deterministic_per_seed() {
        let spec = PatternSpec {
            random: true,
            ..Default::default()
        };
        let mut a = rng_from_seed(42);
        let mut b = rng_from_seed(42);
        let pa = resolve(&spec, cmd("udue"), &mut a, &ParityPolicy::default());
        let pb = resolve(&spec, cmd("udue"), &mut b, &ParityPolicy::default());
        assert_eq!(pa, pb);
    }

    #[test]
    fn zero_default_skips_resolution() {
        let spec = PatternSpec::default();
        let mut rng = rng_from_seed(1);
        assert_eq!(
            resolve(&spec, cmd("enable"), &mut rng, &ParityPolicy::default()),
            0
        );
    }
}
