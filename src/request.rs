//! Write requests and their completion slots.
//!
//! A caller of [`Queue::put`](crate::Queue::put) borrows a [`RequestSlot`]
//! from the pool, copies its payload into the slot's buffer, and hands a
//! [`WriteRequest`] to the writer. The writer sends back a [`Completion`]
//! carrying the result and the buffer, so the allocation is reused by the
//! next caller.

use crossbeam::channel::{bounded, select, Receiver, Sender, TryRecvError};
use crossbeam::queue::ArrayQueue;

use crate::segment::LEN_PREFIX;
use crate::{Error, Result};

/// Buffers that grew past this are dropped instead of pooled.
const MAX_POOLED_CAPACITY: usize = 1024 * 1024;

pub(crate) struct Completion {
    result: Result<u64>,
    data: Vec<u8>,
}

pub(crate) struct WriteRequest {
    data: Vec<u8>,
    done: Sender<Completion>,
}

impl WriteRequest {
    pub(crate) fn data(&self) -> &[u8] {
        &self.data
    }

    /// Size of the record once framed.
    pub(crate) fn framed_len(&self) -> usize {
        LEN_PREFIX + self.data.len()
    }

    pub(crate) fn complete(self, result: Result<u64>) {
        // The slot's receiver lives as long as the waiting caller.
        let _ = self.done.send(Completion {
            result,
            data: self.data,
        });
    }
}

pub(crate) struct RequestSlot {
    tx: Sender<Completion>,
    rx: Receiver<Completion>,
    buf: Vec<u8>,
}

impl RequestSlot {
    fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self {
            tx,
            rx,
            buf: Vec::new(),
        }
    }

    /// Build a request carrying a copy of `payload`.
    pub(crate) fn request(&mut self, payload: &[u8]) -> WriteRequest {
        let mut data = std::mem::take(&mut self.buf);
        data.clear();
        data.extend_from_slice(payload);
        WriteRequest {
            data,
            done: self.tx.clone(),
        }
    }

    /// Block until the writer completes the request or exits.
    ///
    /// Returns `None` when the writer exited without answering; the slot must
    /// then not be reused.
    pub(crate) fn wait(&mut self, writer_exited: &Receiver<()>) -> Option<Result<u64>> {
        let completion = select! {
            recv(self.rx) -> msg => msg.ok(),
            recv(writer_exited) -> _ => self.rx.try_recv().ok(),
        }?;
        self.buf = completion.data;
        Some(completion.result)
    }

    fn drain(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(stale) => self.buf = stale.data,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }
}

pub(crate) struct RequestPool {
    slots: ArrayQueue<RequestSlot>,
}

impl RequestPool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: ArrayQueue::new(capacity.max(1)),
        }
    }

    pub(crate) fn get(&self) -> RequestSlot {
        match self.slots.pop() {
            Some(mut slot) => {
                slot.drain();
                slot
            }
            None => RequestSlot::new(),
        }
    }

    pub(crate) fn put(&self, mut slot: RequestSlot) {
        if slot.buf.capacity() > MAX_POOLED_CAPACITY {
            slot.buf = Vec::new();
        }
        let _ = self.slots.push(slot);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.len()
    }
}

/// Complete `request` with the error for a queue that stopped accepting work.
pub(crate) fn reject_closed(request: WriteRequest) {
    request.complete(Err(Error::AlreadyClosed));
}
