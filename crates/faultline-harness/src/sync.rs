//! Producer/consumer synchronization around the fault point.
//!
//! One shared integer cell coordinates the two threads of a copyback test:
//!
//! ```text
//! value  producer                       consumer
//! ─────  ────────                       ────────
//!   0    initial                        initial
//!   1    waits for 1, then injects      writes 1 to release the producer
//!   2    writes 2 after injecting       waits for 2, then invokes
//!   3    waits for 3, then exits        writes 3 after invoking
//!  -1    abort; either side may write it, both treat it as terminal
//! ```
//!
//! Transitions are monotonically increasing except that `Aborted` is
//! reachable from any state and terminal.
//!
//! Waiting is a calibrated software delay loop, not a blocking sleep: the
//! harness deliberately leaves scheduler and trap-handling state undisturbed
//! this close to the fault point. The calibration runs a fixed iteration
//! count, subtracts the measured timing-call overhead, and floors the result
//! at one loop per microsecond.

use log::{debug, error};
use std::hint::black_box;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Iterations of the calibration loop.
pub const CALIBRATE_LOOPS: u64 = 1 << 20;

/// Default bound on any single synchronization wait.
pub const SYNC_WAIT_MAX_US: u64 = 5_000_000;

// ═══════════════════════════════════════════════════════════════════════
//  Calibrated delay
// ═══════════════════════════════════════════════════════════════════════

/// Loops-per-microsecond delay factor, calibrated once per thread while it
/// is bound to its target CPU.
#[derive(Debug, Clone, Copy)]
pub struct DelayLoop {
    loops_per_us: u64,
}

impl DelayLoop {
    /// Calibrate on the current CPU.
    pub fn calibrate() -> Self {
        let before = Instant::now();
        spin(CALIBRATE_LOOPS);
        let after = Instant::now();
        let probe = Instant::now();

        // Subtract the cost of the timing call itself.
        let overhead = probe.duration_since(after);
        let elapsed = after.duration_since(before).saturating_sub(overhead);

        let us = (elapsed.as_micros() as u64).max(1);
        let loops_per_us = (CALIBRATE_LOOPS / us).max(1);
        debug!("delay calibration: {us} us for {CALIBRATE_LOOPS} loops -> {loops_per_us} loops/us");
        Self { loops_per_us }
    }

    /// Fixed factor, for tests and for contexts that never reach the fault
    /// window.
    pub fn from_loops_per_us(loops_per_us: u64) -> Self {
        Self {
            loops_per_us: loops_per_us.max(1),
        }
    }

    /// Busy-wait roughly `us` microseconds.
    #[inline]
    pub fn delay_us(&self, us: u64) {
        spin(self.loops_per_us.saturating_mul(us));
    }

    /// The calibrated factor.
    pub fn loops_per_us(&self) -> u64 {
        self.loops_per_us
    }
}

#[inline]
fn spin(n: u64) {
    let mut count = 0u64;
    for _ in 0..n {
        count = black_box(count.wrapping_add(1));
    }
    black_box(count);
}

// ═══════════════════════════════════════════════════════════════════════
//  Sync cell
// ═══════════════════════════════════════════════════════════════════════

/// States of the shared cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SyncState {
    Init = 0,
    GoInject = 1,
    Injected = 2,
    Invoked = 3,
    Aborted = -1,
}

/// The shared integer, one per producer/consumer pair.
///
/// The state machine provides the cross-thread ordering; the atomic provides
/// the access safety.
#[derive(Debug, Clone)]
pub struct SyncCell(Arc<AtomicI32>);

impl SyncCell {
    pub fn new() -> Self {
        Self(Arc::new(AtomicI32::new(SyncState::Init as i32)))
    }

    /// Publish a state.
    #[inline]
    pub fn signal(&self, state: SyncState) {
        self.0.store(state as i32, Ordering::SeqCst);
    }

    /// Raw current value.
    #[inline]
    pub fn load(&self) -> i32 {
        self.0.load(Ordering::SeqCst)
    }

    /// Abort the protocol; terminal from any state.
    #[inline]
    pub fn abort(&self) {
        self.signal(SyncState::Aborted);
    }
}

impl Default for SyncCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The expected value arrived.
    Ok,
    /// The peer (or a previous timeout) aborted; terminal.
    Aborted,
    /// The bound expired; the cell has been set to `Aborted` so the peer
    /// eventually un-blocks.
    TimedOut,
}

/// A synchronization failure, recorded against the command.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("timed out after {waited_us} us waiting for sync state {expected:?}")]
    Timeout { expected: SyncState, waited_us: u64 },
    #[error("peer aborted while waiting for sync state {expected:?}")]
    Aborted { expected: SyncState },
}

/// One participant's handle on the shared cell.
#[derive(Debug, Clone)]
pub struct SyncChannel {
    cell: SyncCell,
    delay: DelayLoop,
}

impl SyncChannel {
    pub fn new(cell: SyncCell, delay: DelayLoop) -> Self {
        Self { cell, delay }
    }

    /// Publish a state.
    pub fn signal(&self, state: SyncState) {
        self.cell.signal(state);
    }

    /// Wait until the cell holds `expected`, polling with the calibrated
    /// delay. `timeout_us == 0` waits forever. On timeout the cell is set to
    /// `Aborted` before returning, so the peer cannot stay blocked.
    pub fn wait(&self, expected: SyncState, timeout_us: u64) -> WaitOutcome {
        let mut remaining = timeout_us;
        loop {
            let observed = self.cell.load();
            if observed == expected as i32 {
                return WaitOutcome::Ok;
            }
            if observed == SyncState::Aborted as i32 {
                return WaitOutcome::Aborted;
            }
            if timeout_us != 0 {
                if remaining == 0 {
                    error!("sync wait for {expected:?} timed out after {timeout_us} us");
                    self.cell.abort();
                    return WaitOutcome::TimedOut;
                }
                remaining -= 1;
            }
            self.delay.delay_us(1);
        }
    }

    /// `wait`, mapped onto the command error taxonomy.
    pub fn wait_for(&self, expected: SyncState, timeout_us: u64) -> Result<(), SyncError> {
        match self.wait(expected, timeout_us) {
            WaitOutcome::Ok => Ok(()),
            WaitOutcome::Aborted => Err(SyncError::Aborted { expected }),
            WaitOutcome::TimedOut => Err(SyncError::Timeout {
                expected,
                waited_us: timeout_us,
            }),
        }
    }

    /// The underlying cell.
    pub fn cell(&self) -> &SyncCell {
        &self.cell
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn fast_channel(cell: &SyncCell) -> SyncChannel {
        SyncChannel::new(cell.clone(), DelayLoop::from_loops_per_us(1))
    }

    #[test]
    fn calibration_floors_at_one() {
        let d = DelayLoop::calibrate();
        assert!(d.loops_per_us() >= 1);
    }

    #[test]
    fn happy_path_handshake() {
        // Consumer writes 1 -> producer observes 1, writes 2 -> consumer
        // observes 2, writes 3 -> producer observes 3 and exits.
        let cell = SyncCell::new();
        let producer_chan = fast_channel(&cell);
        let consumer_chan = fast_channel(&cell);

        let producer = thread::spawn(move || {
            producer_chan.wait_for(SyncState::GoInject, SYNC_WAIT_MAX_US)?;
            producer_chan.signal(SyncState::Injected);
            producer_chan.wait_for(SyncState::Invoked, SYNC_WAIT_MAX_US)
        });

        consumer_chan.signal(SyncState::GoInject);
        consumer_chan
            .wait_for(SyncState::Injected, SYNC_WAIT_MAX_US)
            .unwrap();
        consumer_chan.signal(SyncState::Invoked);

        producer.join().unwrap().unwrap();
        assert_eq!(cell.load(), SyncState::Invoked as i32);
    }

    #[test]
    fn timeout_writes_aborted_and_peer_observes_it() {
        // Producer waits for state 1 which never arrives.
        let cell = SyncCell::new();
        let producer_chan = fast_channel(&cell);
        let outcome = producer_chan.wait(SyncState::GoInject, 5_000_000);
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert_eq!(cell.load(), SyncState::Aborted as i32);

        // Consumer later observes the abort instead of its expected value.
        let consumer_chan = fast_channel(&cell);
        let outcome = consumer_chan.wait(SyncState::Injected, 5_000_000);
        assert_eq!(outcome, WaitOutcome::Aborted);
    }

    #[test]
    fn abort_observation_never_overwrites_expected() {
        let cell = SyncCell::new();
        cell.abort();
        let chan = fast_channel(&cell);
        assert_eq!(chan.wait(SyncState::Injected, 1_000), WaitOutcome::Aborted);
        // An observed abort leaves the cell terminal.
        assert_eq!(cell.load(), SyncState::Aborted as i32);
    }

    #[test]
    fn zero_timeout_waits_until_signal() {
        let cell = SyncCell::new();
        let waiter = fast_channel(&cell);
        let signaller = cell.clone();

        let t = thread::spawn(move || waiter.wait(SyncState::GoInject, 0));
        thread::sleep(std::time::Duration::from_millis(5));
        signaller.signal(SyncState::GoInject);
        assert_eq!(t.join().unwrap(), WaitOutcome::Ok);
    }
}
