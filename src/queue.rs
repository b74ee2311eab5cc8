//! The queue facade.
//!
//! # Lifecycle
//!
//! ```text
//! Queue::new(config)   defaults applied, nothing on disk yet
//! queue.init()         load/create segments, start writer (+ commit ticker)
//! queue.put(..)        any number of threads
//! queue.close()        open -> closing -> closed, exactly once
//! ```
//!
//! # Example
//!
//! ```no_run
//! use diskqueue::{Queue, QueueConfig};
//!
//! let queue = Queue::open(QueueConfig::new("./orders"))?;
//! let offset = queue.put(b"hello")?;
//! let records = queue.read(offset, Vec::new())?;
//! assert_eq!(records[0], b"hello");
//! queue.close()?;
//! # Ok::<(), diskqueue::Error>(())
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, select, tick, Receiver, Sender};
use log::{debug, info, warn};

use crate::config::QueueConfig;
use crate::meta::{FileMeta, QueueMeta, META_FILE};
use crate::request::{RequestPool, WriteRequest};
use crate::segment::{Segment, SEGMENT_DIR};
use crate::writer::{retry_until_ok, WriteLoop};
use crate::{Error, Result};

const OPEN: u32 = 0;
const CLOSING: u32 = 1;
const CLOSED: u32 = 2;

const POOL_SLOTS: usize = 256;

/// Segments plus their metadata, shared by the writer, the commit ticker and
/// readers.
pub(crate) struct Store {
    segment_dir: PathBuf,
    meta: QueueMeta,
    segments: RwLock<Vec<Arc<Segment>>>,
}

impl Store {
    pub(crate) fn open(config: &QueueConfig) -> Result<Self> {
        let segment_dir = config.directory.join(SEGMENT_DIR);
        std::fs::create_dir_all(&segment_dir)?;
        let meta = QueueMeta::open(&config.directory)?;

        let files = meta.files()?;
        let last = files.len().saturating_sub(1);
        let mut segments = Vec::with_capacity(files.len().max(1));
        for (index, file) in files.iter().enumerate() {
            let mut segment = Segment::open(&segment_dir, index as u32, file)?;
            if index < last {
                segment.shrink()?;
            }
            segments.push(Arc::new(segment));
        }

        if segments.is_empty() {
            let segment = Segment::create(&segment_dir, 0, 0, config.segment_size)?;
            meta.add_file(0)?;
            segments.push(Arc::new(segment));
        }

        Ok(Self {
            segment_dir,
            meta,
            segments: RwLock::new(segments),
        })
    }

    /// Map an existing queue for reading. Nothing is created, shrunk or
    /// flushed, so this is safe next to a live writer in another process.
    pub(crate) fn open_read_only(directory: &Path) -> Result<Self> {
        let meta = QueueMeta::open_read_only(directory)?;
        let segment_dir = directory.join(SEGMENT_DIR);
        let segments = meta
            .files()?
            .iter()
            .enumerate()
            .map(|(index, file)| {
                Segment::open_read_only(&segment_dir, index as u32, file).map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            segment_dir,
            meta,
            segments: RwLock::new(segments),
        })
    }

    pub(crate) fn meta(&self) -> &QueueMeta {
        &self.meta
    }

    pub(crate) fn num_segments(&self) -> Result<usize> {
        Ok(self.segments()?.len())
    }

    pub(crate) fn segment(&self, index: u32) -> Result<Arc<Segment>> {
        self.segments()?
            .get(index as usize)
            .cloned()
            .ok_or(Error::CorruptMetadata("metadata names a missing segment"))
    }

    pub(crate) fn active_segment(&self) -> Result<Arc<Segment>> {
        self.segments()?
            .last()
            .cloned()
            .ok_or(Error::Corrupt("queue has no active segment"))
    }

    /// Seal the active segment and start a new one right after it.
    ///
    /// The sealed segment is flushed synchronously first, so its bytes reach
    /// disk before any metadata that names its successor.
    pub(crate) fn rotate(&self, capacity: usize) -> Result<Arc<Segment>> {
        let sealed = self.active_segment()?;
        sealed.flush()?;
        let index = sealed.index() + 1;
        let start_offset = sealed.end_offset();
        let segment = Arc::new(Segment::create(
            &self.segment_dir,
            index,
            start_offset,
            capacity,
        )?);
        if self.meta.add_file(start_offset)? != index {
            return Err(Error::CorruptMetadata("segment index out of step with metadata"));
        }
        self.segments
            .write()
            .map_err(|_| Error::Corrupt("segment list lock poisoned"))?
            .push(Arc::clone(&segment));
        debug!("rotated to segment {index} at offset {start_offset}");
        Ok(segment)
    }

    fn flush_async(&self) -> Result<()> {
        self.active_segment()?.flush_async()?;
        self.meta.flush_async()
    }

    /// Flush every segment, then persist the metadata.
    fn close(&self) -> Result<()> {
        for segment in self.segments()?.iter() {
            segment.flush()?;
        }
        self.meta.close()
    }

    fn segments(&self) -> Result<std::sync::RwLockReadGuard<'_, Vec<Arc<Segment>>>> {
        self.segments
            .read()
            .map_err(|_| Error::Corrupt("segment list lock poisoned"))
    }
}

/// Everything that exists only after `init`.
struct Runtime {
    store: Arc<Store>,
    intake: Sender<WriteRequest>,
    writer_exited: Receiver<()>,
    shutdown: Mutex<Option<Sender<()>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Broadcast shutdown and wait for the background threads.
    fn stop(&self) {
        if let Ok(mut shutdown) = self.shutdown.lock() {
            shutdown.take();
        }
        let handles = match self.handles.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let name = handle.thread().name().unwrap_or("diskqueue").to_string();
            if handle.join().is_err() {
                warn!("{name} thread panicked");
            }
        }
    }
}

/// A segmented, append-only, disk-backed queue.
pub struct Queue {
    config: QueueConfig,
    close_state: AtomicU32,
    pool: RequestPool,
    runtime: Option<Runtime>,
}

impl Queue {
    /// Build a queue with defaults applied. Nothing touches disk until
    /// [`init`](Self::init).
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config: config.with_defaults(),
            close_state: AtomicU32::new(OPEN),
            pool: RequestPool::new(POOL_SLOTS),
            runtime: None,
        }
    }

    /// [`new`](Self::new) followed by [`init`](Self::init).
    pub fn open(config: QueueConfig) -> Result<Self> {
        let mut queue = Self::new(config);
        queue.init()?;
        Ok(queue)
    }

    /// Load or create the on-disk state and start the background threads.
    ///
    /// Every segment except the last is shrunk to its recorded size. An empty
    /// directory gets segment 0 at offset 0. Calling `init` on an initialised
    /// queue does nothing.
    ///
    /// # Errors
    ///
    /// - `Error::Io`: directory, metadata or segment files could not be
    ///   created, opened or trimmed
    /// - `Error::CorruptMetadata` / `Error::Corrupt`: metadata disagrees with
    ///   the segment files
    /// - `Error::AlreadyClosing` / `Error::AlreadyClosed`
    pub fn init(&mut self) -> Result<()> {
        self.check_close_state()?;
        if self.runtime.is_some() {
            return Ok(());
        }

        let store = Arc::new(Store::open(&self.config)?);
        let (intake_tx, intake_rx) = bounded(self.config.write_batch);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let (exited_tx, exited_rx) = bounded::<()>(0);

        let writer = WriteLoop::new(
            Arc::clone(&store),
            intake_rx,
            shutdown_rx.clone(),
            exited_tx,
            self.config.write_batch,
            self.config.segment_size,
            self.config.retry_interval(),
        );
        let mut handles = Vec::with_capacity(2);
        handles.push(
            thread::Builder::new()
                .name("diskqueue-writer".to_string())
                .spawn(move || writer.run())?,
        );

        // From here on, dropping `shutdown_tx` stops the writer on any error.
        if self.config.enable_write_buffer {
            let store = Arc::clone(&store);
            let interval = self.config.commit_interval();
            handles.push(
                thread::Builder::new()
                    .name("diskqueue-commit".to_string())
                    .spawn(move || run_commit(store, interval, shutdown_rx))?,
            );
        }

        info!(
            "opened queue at {} ({} segment(s), end offset {})",
            self.config.directory.display(),
            store.num_segments()?,
            store.meta().end_offset()?
        );

        self.runtime = Some(Runtime {
            store,
            intake: intake_tx,
            writer_exited: exited_rx,
            shutdown: Mutex::new(Some(shutdown_tx)),
            handles: Mutex::new(handles),
        });
        Ok(())
    }

    /// Append `payload` and return the global offset of its record.
    ///
    /// Blocks until the writer has written the batch containing it. During
    /// storage trouble this stalls rather than fails.
    ///
    /// # Errors
    ///
    /// - `Error::AlreadyClosing` / `Error::AlreadyClosed`
    /// - `Error::MsgTooLarge`: `payload` exceeds `max_msg_size`
    /// - `Error::NotInitialized`: `init` has not run
    pub fn put(&self, payload: &[u8]) -> Result<u64> {
        self.check_close_state()?;
        if payload.len() > self.config.max_msg_size {
            return Err(Error::MsgTooLarge {
                len: payload.len(),
                max: self.config.max_msg_size,
            });
        }
        let runtime = self.runtime()?;

        let mut slot = self.pool.get();
        let request = slot.request(payload);
        let sent = select! {
            send(runtime.intake, request) -> res => res.is_ok(),
            recv(runtime.writer_exited) -> _ => false,
        };
        if !sent {
            self.pool.put(slot);
            return Err(Error::AlreadyClosed);
        }

        match slot.wait(&runtime.writer_exited) {
            Some(result) => {
                self.pool.put(slot);
                result
            }
            // The writer is gone; the request may still sit in the intake.
            None => Err(Error::AlreadyClosed),
        }
    }

    /// Shut the queue down.
    ///
    /// Exactly one caller performs the shutdown: it stops the writer (letting
    /// the batch in flight finish), then persists metadata, retrying until
    /// that succeeds. Every other caller returns at once with
    /// `AlreadyClosing` or `AlreadyClosed`.
    pub fn close(&self) -> Result<()> {
        if self
            .close_state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return self.check_close_state();
        }

        if let Some(runtime) = &self.runtime {
            runtime.stop();
            retry_until_ok(self.config.retry_interval(), "metadata close", || {
                runtime.store.close()
            });
        }

        self.close_state.store(CLOSED, Ordering::Release);
        info!("closed queue at {}", self.config.directory.display());
        Ok(())
    }

    /// Close the queue if needed and remove its files from disk.
    pub fn delete(&self) -> Result<()> {
        match self.close() {
            Ok(()) | Err(Error::AlreadyClosed) => {}
            Err(err) => return Err(err),
        }
        remove_if_exists(&self.config.directory.join(SEGMENT_DIR), true)?;
        remove_if_exists(&self.config.directory.join(META_FILE), false)?;
        info!("deleted queue at {}", self.config.directory.display());
        Ok(())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn directory(&self) -> &Path {
        &self.config.directory
    }

    pub fn num_segments(&self) -> Result<usize> {
        self.store()?.num_segments()
    }

    /// Global offset one past the last committed record.
    pub fn end_offset(&self) -> Result<u64> {
        self.store()?.meta().end_offset()
    }

    /// Snapshot of every segment's metadata record.
    pub fn segment_metas(&self) -> Result<Vec<FileMeta>> {
        self.store()?.meta().files()
    }

    pub fn check_close_state(&self) -> Result<()> {
        match self.close_state.load(Ordering::Acquire) {
            OPEN => Ok(()),
            CLOSING => Err(Error::AlreadyClosing),
            CLOSED => Err(Error::AlreadyClosed),
            state => Err(Error::UnknownCloseState(state)),
        }
    }

    pub(crate) fn store(&self) -> Result<&Arc<Store>> {
        Ok(&self.runtime()?.store)
    }

    fn runtime(&self) -> Result<&Runtime> {
        self.runtime.as_ref().ok_or(Error::NotInitialized)
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        if self.runtime.is_none() || self.close_state.load(Ordering::Acquire) != OPEN {
            return;
        }
        if let Err(err) = self.close() {
            warn!("close on drop failed: {err}");
        }
    }
}

/// Periodically schedule write-back of dirty pages until shutdown.
fn run_commit(store: Arc<Store>, interval: Duration, shutdown: Receiver<()>) {
    let ticker = tick(interval);
    loop {
        let stop = select! {
            recv(ticker) -> _ => false,
            recv(shutdown) -> _ => true,
        };
        if stop {
            break;
        }
        if let Err(err) = store.flush_async() {
            warn!("commit flush failed: {err}");
        }
    }
}

fn remove_if_exists(path: &Path, dir: bool) -> Result<()> {
    let removed = if dir {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match removed {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
