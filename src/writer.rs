//! The single writer.
//!
//! One dedicated thread owns the tail of the queue. It pulls requests off the
//! bounded intake, combines whatever is already queued into a batch, frames
//! the batch into one vectored write, and answers every request with its
//! global offset. Nothing else mutates the active segment or its metadata
//! record, so the hot path takes no lock around segment bytes.
//!
//! Failure policy: a batch that overflows the active segment moves whole to a
//! new segment. Any other failure of the write or of the metadata update is
//! logged and retried after `retry_interval`, indefinitely. Producers stall
//! rather than lose data.

use std::io::IoSlice;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{select, Receiver, Sender};
use log::error;

use crate::meta::now_ns;
use crate::queue::Store;
use crate::request::{reject_closed, WriteRequest};
use crate::segment::{encode_len, Segment, LEN_PREFIX};
use crate::{Error, Result};

/// Run `op` until it succeeds, sleeping `interval` after each failure.
pub(crate) fn retry_until_ok<T>(
    interval: Duration,
    what: &str,
    mut op: impl FnMut() -> Result<T>,
) -> T {
    loop {
        match op() {
            Ok(value) => return value,
            Err(err) => {
                error!("{what} failed, retrying in {interval:?}: {err}");
                thread::sleep(interval);
            }
        }
    }
}

pub(crate) struct WriteLoop {
    store: Arc<Store>,
    intake: Receiver<WriteRequest>,
    shutdown: Receiver<()>,
    // Dropped when the loop returns, which wakes every waiting `put`.
    _exited: Sender<()>,
    write_batch: usize,
    segment_size: usize,
    retry_interval: Duration,
    batch: Vec<WriteRequest>,
    prefixes: Vec<[u8; LEN_PREFIX]>,
    carry: Option<WriteRequest>,
}

impl WriteLoop {
    pub(crate) fn new(
        store: Arc<Store>,
        intake: Receiver<WriteRequest>,
        shutdown: Receiver<()>,
        exited: Sender<()>,
        write_batch: usize,
        segment_size: usize,
        retry_interval: Duration,
    ) -> Self {
        Self {
            store,
            intake,
            shutdown,
            _exited: exited,
            write_batch,
            segment_size,
            retry_interval,
            batch: Vec::with_capacity(write_batch),
            prefixes: Vec::with_capacity(write_batch),
            carry: None,
        }
    }

    pub(crate) fn run(mut self) {
        loop {
            let seed = match self.carry.take() {
                Some(request) => request,
                None => {
                    let next = select! {
                        recv(self.intake) -> msg => msg.ok(),
                        recv(self.shutdown) -> _ => None,
                    };
                    match next {
                        Some(request) => request,
                        None => break,
                    }
                }
            };
            self.collect(seed);
            self.commit();
        }
        self.reject_pending();
    }

    /// Seed a batch and top it up with requests that are already queued.
    ///
    /// Never waits for more to arrive. A request that would push the batch
    /// past one segment's capacity is held back as the next seed.
    fn collect(&mut self, seed: WriteRequest) {
        let mut bytes = seed.framed_len();
        self.batch.push(seed);
        while self.batch.len() < self.write_batch {
            let Ok(request) = self.intake.try_recv() else {
                break;
            };
            if bytes + request.framed_len() > self.segment_size {
                self.carry = Some(request);
                break;
            }
            bytes += request.framed_len();
            self.batch.push(request);
        }
    }

    fn commit(&mut self) {
        let mut batch = std::mem::take(&mut self.batch);
        let mut prefixes = std::mem::take(&mut self.prefixes);
        prefixes.clear();
        prefixes.extend(batch.iter().map(|request| encode_len(request.data().len())));

        let (segment, local_start) = {
            let mut bufs = Vec::with_capacity(batch.len() * 2);
            for (prefix, request) in prefixes.iter().zip(&batch) {
                bufs.push(IoSlice::new(prefix));
                bufs.push(IoSlice::new(request.data()));
            }
            retry_until_ok(self.retry_interval, "batch write", || {
                self.write_to_tail(&bufs)
            })
        };

        // Callers are answered only once the batch is recorded in metadata.
        let added = batch.len() as u64;
        retry_until_ok(self.retry_interval, "metadata update", || {
            self.store.meta().update_file_stat(
                segment.index(),
                added,
                segment.wrote_position(),
                now_ns(),
            )
        });

        let mut offset = segment.start_offset() + local_start;
        for request in batch.drain(..) {
            let framed = request.framed_len() as u64;
            request.complete(Ok(offset));
            offset += framed;
        }
        self.batch = batch;
        self.prefixes = prefixes;
    }

    /// Write the whole batch to the active segment, rotating once on overflow.
    fn write_to_tail(&self, bufs: &[IoSlice<'_>]) -> Result<(Arc<Segment>, u64)> {
        let segment = self.store.active_segment()?;
        match segment.write_vectored(bufs) {
            Ok(start) => Ok((segment, start)),
            Err(Error::WriteBeyond) => {
                let next = self.store.rotate(self.segment_size)?;
                let start = next.write_vectored(bufs)?;
                Ok((next, start))
            }
            Err(err) => Err(err),
        }
    }

    /// Answer everything still queued after shutdown with `AlreadyClosed`.
    fn reject_pending(&mut self) {
        if let Some(request) = self.carry.take() {
            reject_closed(request);
        }
        while let Ok(request) = self.intake.try_recv() {
            reject_closed(request);
        }
    }
}
