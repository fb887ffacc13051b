//! Cross-process configuration store.
//!
//! Concurrent injector processes share global kernel debug state, so the
//! first instance snapshots the kernel variables and the last one out
//! restores them. The coordination record is a fixed-size binary file at a
//! well-known path, protected end-to-end by an exclusive advisory `flock`:
//! the lock is taken before the read of every read-modify-write window and
//! released (by closing the file) only after the write — or after the file
//! has been removed.
//!
//! Invariants: `use_count >= 0`; the file exists iff the aggregate count is
//! positive; the snapshot is restored at most once, exactly on the 1 → 0
//! transition with `saved == true`.
//!
//! Store failures are process-fatal: without the record, debug-state
//! consistency across instances cannot be guaranteed.

use faultline_gateway::{DriverError, DriverGateway, KernelVars};
use log::{debug, info};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Well-known record path for production use.
pub const DEFAULT_CONFIG_PATH: &str = "/var/run/faultline.conf";

/// On-disk record size; anything else is corruption.
pub const CONFIG_RECORD_SIZE: usize = 32;

/// Fatal store failures.
#[derive(Debug, Error)]
pub enum ConfigStoreError {
    #[error("config store i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("failed to lock config record {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("config record has size {len}, expected {CONFIG_RECORD_SIZE}")]
    Corrupt { len: u64 },
    #[error(transparent)]
    Driver(#[from] DriverError),
}

// ═══════════════════════════════════════════════════════════════════════
//  Record codec
// ═══════════════════════════════════════════════════════════════════════

/// In-memory image of the on-disk record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigRecord {
    /// Live injector instances. Never negative on disk.
    pub use_count: i32,
    /// A kernel-variable snapshot has been taken.
    pub saved: bool,
    /// Read/write intent carried to the driver on restore.
    pub restore_intent: bool,
    /// The snapshot itself.
    pub kvars: KernelVars,
}

impl ConfigRecord {
    /// Pack into the fixed wire layout.
    pub fn encode(&self) -> [u8; CONFIG_RECORD_SIZE] {
        let mut buf = [0u8; CONFIG_RECORD_SIZE];
        buf[0..4].copy_from_slice(&self.use_count.to_le_bytes());
        buf[4] = u8::from(self.saved);
        buf[5] = u8::from(self.restore_intent);
        buf[8..12].copy_from_slice(&self.kvars.debug_level.to_le_bytes());
        buf[12..16].copy_from_slice(&self.kvars.error_reporting.to_le_bytes());
        buf[16..20].copy_from_slice(&self.kvars.ce_throttle.to_le_bytes());
        buf
    }

    /// Unpack from the fixed wire layout.
    pub fn decode(buf: &[u8; CONFIG_RECORD_SIZE]) -> Self {
        Self {
            use_count: i32::from_le_bytes(buf[0..4].try_into().unwrap()),
            saved: buf[4] != 0,
            restore_intent: buf[5] != 0,
            kvars: KernelVars {
                debug_level: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
                error_reporting: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
                ce_throttle: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Store
// ═══════════════════════════════════════════════════════════════════════

/// Handle on the shared record for one injector instance.
pub struct ConfigStore {
    path: PathBuf,
    gateway: Arc<dyn DriverGateway>,
    acquired: bool,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>, gateway: Arc<dyn DriverGateway>) -> Self {
        Self {
            path: path.into(),
            gateway,
            acquired: false,
        }
    }

    /// Whether this instance currently holds a reference.
    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    /// Register this instance: open-or-create, lock, read-or-initialize,
    /// snapshot the kernel variables if this is the very first instance ever
    /// to see the file, increment, persist.
    pub fn acquire(&mut self) -> Result<(), ConfigStoreError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        lock_exclusive(&file, &self.path)?;

        let len = file.metadata()?.len();
        let mut record = match len {
            // Freshly created (or a creator died before the first write):
            // this instance owns initialization.
            0 => {
                let mut record = ConfigRecord::default();
                self.gateway.kernel_vars(&mut record.kvars, false)?;
                record.saved = true;
                debug!("config: initialized record, snapshot taken: {:?}", record.kvars);
                record
            }
            _ => read_record(&mut file, len)?,
        };

        record.use_count += 1;
        write_record(&mut file, &record)?;
        self.acquired = true;
        info!(
            "config: instance count now {} in {}",
            record.use_count,
            self.path.display()
        );
        // Dropping the file releases the lock, strictly after the write.
        Ok(())
    }

    /// Drop this instance's reference. On the 1 → 0 transition with a saved
    /// snapshot the kernel variables are pushed back through the gateway,
    /// and the record file is removed while the lock is still held.
    pub fn release(&mut self) -> Result<(), ConfigStoreError> {
        // Only touch the record if acquire() succeeded in this process.
        if !self.acquired {
            return Ok(());
        }
        self.acquired = false;

        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        lock_exclusive(&file, &self.path)?;

        let len = file.metadata()?.len();
        let mut record = read_record(&mut file, len)?;
        record.use_count -= 1;

        if record.use_count <= 0 {
            if record.saved {
                record.restore_intent = true;
                let mut kvars = record.kvars;
                self.gateway.kernel_vars(&mut kvars, true)?;
                info!("config: restored kernel variables: {kvars:?}");
            }
            // Remove while locked so a racing acquire either sees the live
            // record or creates a fresh one, never a torn in-between.
            fs::remove_file(&self.path)?;
            debug!("config: removed record {}", self.path.display());
        } else {
            write_record(&mut file, &record)?;
            info!(
                "config: instance count now {} in {}",
                record.use_count,
                self.path.display()
            );
        }
        Ok(())
    }

    /// Current record, for inspection. `None` if the file does not exist.
    pub fn peek(&self) -> Result<Option<ConfigRecord>, ConfigStoreError> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        lock_exclusive(&file, &self.path)?;
        let len = file.metadata()?.len();
        Ok(Some(read_record(&mut file, len)?))
    }
}

impl Drop for ConfigStore {
    fn drop(&mut self) {
        if self.acquired {
            // Best effort; a failure here already means the process is on a
            // fatal path.
            if let Err(e) = self.release() {
                log::error!("config: release on drop failed: {e}");
            }
        }
    }
}

fn lock_exclusive(file: &File, path: &Path) -> Result<(), ConfigStoreError> {
    // SAFETY: flock is a plain syscall on a valid owned descriptor.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
    if rc == -1 {
        return Err(ConfigStoreError::Lock {
            path: path.to_path_buf(),
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

fn read_record(file: &mut File, len: u64) -> Result<ConfigRecord, ConfigStoreError> {
    if len != CONFIG_RECORD_SIZE as u64 {
        return Err(ConfigStoreError::Corrupt { len });
    }
    let mut buf = [0u8; CONFIG_RECORD_SIZE];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut buf)?;
    Ok(ConfigRecord::decode(&buf))
}

fn write_record(file: &mut File, record: &ConfigRecord) -> Result<(), ConfigStoreError> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&record.encode())?;
    file.flush()?;
    Ok(())
}
