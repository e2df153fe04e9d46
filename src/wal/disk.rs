//! Disk-based WAL Implementation with Group Commit
//!
//! Features:
//! - Configurable group commit interval
//! - Configurable batch size
//! - Async background flush
//! - Checksummed frames; a torn tail left by a crash is cut off at open
//!
//! File layout:
//! ```text
//! [magic u32][base lsn u64] then frames of [len u32][crc32 u32][bincode LogRecord]
//! ```
//! The base LSN survives truncation so numbering never goes backwards.

use super::{LogRecord, Lsn, WriteAheadLog};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Error, ErrorKind, Result, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

const WAL_MAGIC: u32 = 0x4C57_414C; // "LWAL"
const HEADER_LEN: usize = 12;
const FRAME_HEADER_LEN: usize = 8;

/// Disk-based Write-Ahead Log with group commit
pub struct DiskWAL {
    file: Arc<Mutex<BufWriter<File>>>,
    path: PathBuf,
    lsn: AtomicU64,
    size: Arc<AtomicU64>,
    /// Pending records to be written
    pending: Arc<Mutex<VecDeque<LogRecord>>>,
    /// Signal for background thread
    signal: Arc<Condvar>,
    /// Background flush thread handle
    flush_thread: Option<JoinHandle<()>>,
    /// Shutdown flag
    shutdown: Arc<AtomicBool>,
    /// Config
    config: DiskWalConfig,
}

/// Configuration for DiskWAL
#[derive(Debug, Clone)]
pub struct DiskWalConfig {
    /// Group commit interval in milliseconds
    /// Default: 10ms (good balance of latency vs throughput)
    pub group_commit_ms: u64,
    /// Max batch size before force flush
    /// Default: 1000 records
    pub max_batch: usize,
    /// Buffer size for file I/O
    /// Default: 64KB
    pub buffer_size: usize,
    /// fsync as part of every commit
    pub sync_on_commit: bool,
}

impl Default for DiskWalConfig {
    fn default() -> Self {
        Self {
            group_commit_ms: 10,
            max_batch: 1000,
            buffer_size: 64 * 1024,
            sync_on_commit: true,
        }
    }
}

/// Contents of a WAL file as found on disk.
struct Scan {
    base: Lsn,
    records: Vec<LogRecord>,
    /// Bytes up to the end of the last intact frame
    valid_len: u64,
}

impl DiskWAL {
    /// Create or open WAL at given path with default config
    pub fn new(path: &Path) -> Result<Self> {
        Self::with_config(path, DiskWalConfig::default())
    }

    /// Create or open WAL with custom config
    pub fn with_config(path: &Path, config: DiskWalConfig) -> Result<Self> {
        // Treat path as directory for WAL files
        std::fs::create_dir_all(path)?;

        let wal_path = path.join("wal.log");
        let scan = if wal_path.exists() {
            Self::scan(&wal_path)?
        } else {
            Self::write_header(&wal_path, 0)?;
            Scan {
                base: 0,
                records: Vec::new(),
                valid_len: HEADER_LEN as u64,
            }
        };

        let file = OpenOptions::new().read(true).write(true).open(&wal_path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > scan.valid_len {
            warn!(
                target: "lapis::wal",
                path = %wal_path.display(),
                dropped = on_disk - scan.valid_len,
                "cutting torn WAL tail"
            );
            file.set_len(scan.valid_len)?;
            file.sync_all()?;
        }
        drop(file);
        let file = OpenOptions::new().append(true).open(&wal_path)?;

        let lsn = scan
            .records
            .last()
            .map(|r| r.lsn + 1)
            .unwrap_or(0)
            .max(scan.base);

        let pending = Arc::new(Mutex::new(VecDeque::new()));
        let signal = Arc::new(Condvar::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut wal = Self {
            file: Arc::new(Mutex::new(BufWriter::with_capacity(config.buffer_size, file))),
            path: wal_path,
            lsn: AtomicU64::new(lsn),
            size: Arc::new(AtomicU64::new(scan.valid_len)),
            pending: Arc::clone(&pending),
            signal: Arc::clone(&signal),
            flush_thread: None,
            shutdown: Arc::clone(&shutdown),
            config,
        };

        // Start background flush thread
        wal.flush_thread = Some(wal.start_flush_thread(pending, signal, shutdown));
        debug!(target: "lapis::wal", lsn, records = scan.records.len(), "WAL opened");
        Ok(wal)
    }

    /// Start background flush thread for group commit
    fn start_flush_thread(
        &self,
        pending: Arc<Mutex<VecDeque<LogRecord>>>,
        signal: Arc<Condvar>,
        shutdown: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let file = Arc::clone(&self.file);
        let max_batch = self.config.max_batch;
        let interval = Duration::from_millis(self.config.group_commit_ms);
        let size = Arc::clone(&self.size);

        thread::spawn(move || loop {
            // Wait for signal or timeout
            {
                let mut pending_guard = pending.lock();
                if pending_guard.len() < max_batch && !shutdown.load(Ordering::Acquire) {
                    signal.wait_for(&mut pending_guard, interval);
                }
            }

            if let Err(e) = Self::write_pending(&file, &pending, &size) {
                warn!(target: "lapis::wal", error = %e, "background WAL flush failed");
            }

            // Check shutdown after the final flush
            if shutdown.load(Ordering::Acquire) {
                break;
            }
        })
    }

    /// Move every pending record into the file. Lock order is file, then
    /// pending, so batches reach the file in LSN order.
    fn write_pending(
        file: &Mutex<BufWriter<File>>,
        pending: &Mutex<VecDeque<LogRecord>>,
        size: &AtomicU64,
    ) -> Result<()> {
        let mut file_guard = file.lock();
        let records: Vec<LogRecord> = pending.lock().drain(..).collect();
        if records.is_empty() {
            return Ok(());
        }

        // Encode all records
        let mut encoded = Vec::new();
        for record in &records {
            encoded.extend_from_slice(&Self::encode_record(record)?);
        }

        file_guard.write_all(&encoded)?;
        file_guard.flush()?;
        size.fetch_add(encoded.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn write_header(path: &Path, base: Lsn) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(&WAL_MAGIC.to_le_bytes())?;
        file.write_all(&base.to_le_bytes())?;
        file.sync_all()
    }

    /// Read every intact frame of a WAL file.
    fn scan(path: &Path) -> Result<Scan> {
        let data = std::fs::read(path)?;
        if data.len() < HEADER_LEN {
            // Crashed while creating the file
            Self::write_header(path, 0)?;
            return Ok(Scan {
                base: 0,
                records: Vec::new(),
                valid_len: HEADER_LEN as u64,
            });
        }
        let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if magic != WAL_MAGIC {
            return Err(Error::new(ErrorKind::InvalidData, "not a lapis WAL file"));
        }
        let mut base_bytes = [0u8; 8];
        base_bytes.copy_from_slice(&data[4..HEADER_LEN]);
        let base = Lsn::from_le_bytes(base_bytes);

        let mut records = Vec::new();
        let mut pos = HEADER_LEN;
        while pos + FRAME_HEADER_LEN <= data.len() {
            let len = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]) as usize;
            let crc = u32::from_le_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]]);
            let start = pos + FRAME_HEADER_LEN;
            let Some(payload) = data.get(start..start + len) else {
                break;
            };
            if crc32fast::hash(payload) != crc {
                break;
            }
            match bincode::deserialize::<LogRecord>(payload) {
                Ok(record) => records.push(record),
                Err(_) => break,
            }
            pos = start + len;
        }

        Ok(Scan {
            base,
            records,
            valid_len: pos as u64,
        })
    }

    /// Encode record to a checksummed frame
    fn encode_record(record: &LogRecord) -> Result<Vec<u8>> {
        let payload = bincode::serialize(record).map_err(|e| Error::new(ErrorKind::InvalidData, e))?;
        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DiskWAL {
    fn drop(&mut self) {
        // Signal shutdown
        self.shutdown.store(true, Ordering::Release);
        self.signal.notify_all();

        // Wait for flush thread to finish
        if let Some(handle) = self.flush_thread.take() {
            let _ = handle.join();
        }
    }
}

impl WriteAheadLog for DiskWAL {
    fn append(&self, record: &LogRecord) -> Result<Lsn> {
        // LSN allocation and queueing happen under one lock so the queue
        // stays in LSN order.
        let mut pending = self.pending.lock();
        let lsn = self.lsn.fetch_add(1, Ordering::SeqCst);
        pending.push_back(LogRecord { lsn, ..record.clone() });

        // Signal if batch is ready
        if pending.len() >= self.config.max_batch {
            self.signal.notify_one();
        }
        Ok(lsn)
    }

    fn sync(&self) -> Result<()> {
        // Flush all pending synchronously so fsync is meaningful
        Self::write_pending(&self.file, &self.pending, &self.size)?;
        let file = self.file.lock();
        file.get_ref().sync_data()
    }

    fn flush_commit(&self) -> Result<()> {
        if self.config.sync_on_commit {
            self.sync()
        } else {
            Ok(())
        }
    }

    fn replay_from(&self, lsn: Lsn) -> Result<Vec<LogRecord>> {
        Self::write_pending(&self.file, &self.pending, &self.size)?;
        let scan = {
            let _file = self.file.lock();
            Self::scan(&self.path)?
        };
        Ok(scan.records.into_iter().filter(|r| r.lsn >= lsn).collect())
    }

    fn truncate_before(&self, lsn: Lsn) -> Result<()> {
        Self::write_pending(&self.file, &self.pending, &self.size)?;
        let mut file = self.file.lock();
        file.flush()?;
        let scan = Self::scan(&self.path)?;
        let base = lsn.max(scan.base);

        let tmp = self.path.with_extension("log.tmp");
        Self::write_header(&tmp, base)?;
        let mut kept = 0usize;
        let mut bytes = HEADER_LEN as u64;
        {
            let mut out = BufWriter::new(OpenOptions::new().append(true).open(&tmp)?);
            for record in scan.records.iter().filter(|r| r.lsn >= lsn) {
                let frame = Self::encode_record(record)?;
                out.write_all(&frame)?;
                bytes += frame.len() as u64;
                kept += 1;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;

        let reopened = OpenOptions::new().append(true).open(&self.path)?;
        *file = BufWriter::with_capacity(self.config.buffer_size, reopened);
        self.size.store(bytes, Ordering::Relaxed);
        debug!(target: "lapis::wal", before = lsn, kept, "WAL truncated");
        Ok(())
    }

    fn size_bytes(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    fn current_lsn(&self) -> Lsn {
        self.lsn.load(Ordering::SeqCst)
    }

    fn is_enabled(&self) -> bool {
        true
    }
}
