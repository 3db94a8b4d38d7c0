//! In-process pipes converting between logical service-info tuples and
//! size-budgeted chunks.
//!
//! Two pipe shapes compose into the service-info bus:
//!
//! - [`out_pipe`] (device → owner): modules write logical messages through
//!   an [`UnchunkWriter`]; the driver pulls MTU-bounded chunks from the
//!   paired [`ChunkReader`]. The channel is unbounded so module output never
//!   blocks the driver mid-round.
//! - [`in_pipe`] (owner → device): the driver pushes received chunks into a
//!   [`ChunkWriter`]; the dispatcher pulls reassembled logical messages from
//!   the paired [`UnchunkReader`]. The channel is bounded, so the driver
//!   suspends until the dispatcher keeps up.
//!
//! Either side may close its pipe with an error; the error poisons
//! subsequent reads and writes on both ends. A normal close yields
//! end-of-stream.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::ServiceInfoKV;
use crate::error::PipeError;

/// Result of pulling one chunk from a [`ChunkReader`].
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkRead {
    /// The next chunk, guaranteed to serialize within the requested budget.
    Chunk(ServiceInfoKV),
    /// The next chunk exists but does not fit; the caller should finish the
    /// current outer message with `is_more = true` and retry with a fresh
    /// budget.
    SizeTooSmall,
    /// The writer closed normally; no more chunks will arrive.
    End,
}

#[derive(Default)]
struct Shared {
    error: Mutex<Option<PipeError>>,
}

impl Shared {
    fn poison(&self, err: PipeError) {
        let mut slot = self.error.lock().expect("pipe error mutex");
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn check(&self) -> Option<PipeError> {
        self.error.lock().expect("pipe error mutex").clone()
    }
}

/// Create a device-send pipe. Values written through the [`UnchunkWriter`]
/// are split so that no chunk's serialized form exceeds `mtu` bytes.
pub fn out_pipe(mtu: usize) -> (UnchunkWriter, ChunkReader) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared::default());
    (
        UnchunkWriter {
            tx: Some(tx),
            shared: Arc::clone(&shared),
            mtu,
            key: None,
            buf: Vec::new(),
            emitted: false,
        },
        ChunkReader {
            rx,
            pending: None,
            shared,
        },
    )
}

/// Create an owner-receive pipe carrying whole chunks from the driver to the
/// dispatcher.
pub fn in_pipe() -> (ChunkWriter, UnchunkReader) {
    let (tx, rx) = mpsc::channel(1);
    let shared = Arc::new(Shared::default());
    (
        ChunkWriter {
            tx: Some(tx),
            shared: Arc::clone(&shared),
        },
        UnchunkReader {
            rx,
            pending: None,
            shared,
        },
    )
}

/// A closed [`ChunkReader`] yielding exactly the given chunks, used for the
/// initial device service info of the first loop round.
pub fn preloaded(kvs: Vec<ServiceInfoKV>) -> ChunkReader {
    let (tx, rx) = mpsc::unbounded_channel();
    for kv in kvs {
        // Receiver is alive; an unbounded send cannot fail here.
        let _ = tx.send(kv);
    }
    ChunkReader {
        rx,
        pending: None,
        shared: Arc::new(Shared::default()),
    }
}

/// Writer side of the device-send pipe: logical messages in, chunks out.
pub struct UnchunkWriter {
    tx: Option<mpsc::UnboundedSender<ServiceInfoKV>>,
    shared: Arc<Shared>,
    mtu: usize,
    key: Option<String>,
    buf: Vec<u8>,
    emitted: bool,
}

impl UnchunkWriter {
    /// Begin a new logical message, flushing any previous one.
    pub fn begin(&mut self, module: &str, message: &str) -> Result<(), PipeError> {
        self.flush()?;
        self.key = Some(format!("{module}:{message}"));
        self.emitted = false;
        Ok(())
    }

    /// Append value bytes to the current message, emitting full-size chunks
    /// as the buffer fills.
    pub fn write(&mut self, data: &[u8]) -> Result<(), PipeError> {
        let key = match &self.key {
            Some(k) => k.clone(),
            None => return Err(PipeError::Poisoned("write before begin".into())),
        };
        self.buf.extend_from_slice(data);
        let frag = self.frag_limit(&key);
        while self.buf.len() > frag {
            let rest = self.buf.split_off(frag);
            let chunk = std::mem::replace(&mut self.buf, rest);
            self.send(ServiceInfoKV {
                key: key.clone(),
                value: chunk,
            })?;
            self.emitted = true;
        }
        Ok(())
    }

    /// Close normally: flush the pending message and signal end-of-stream.
    pub fn close(&mut self) -> Result<(), PipeError> {
        self.flush()?;
        self.tx = None;
        Ok(())
    }

    /// Close the pipe with an error; the paired reader (and later writes)
    /// observe it.
    pub fn close_with_error(&mut self, err: PipeError) {
        self.shared.poison(err);
        self.tx = None;
    }

    /// Maximum value bytes per chunk so the serialized `[key, value]` array
    /// stays within the MTU. The margin covers CBOR framing of both fields.
    fn frag_limit(&self, key: &str) -> usize {
        self.mtu.saturating_sub(key.len() + 10).max(1)
    }

    fn flush(&mut self) -> Result<(), PipeError> {
        if let Some(key) = self.key.take() {
            if !self.buf.is_empty() || !self.emitted {
                let value = std::mem::take(&mut self.buf);
                self.send(ServiceInfoKV { key, value })?;
            }
        }
        self.buf.clear();
        Ok(())
    }

    fn send(&self, kv: ServiceInfoKV) -> Result<(), PipeError> {
        match &self.tx {
            Some(tx) => tx
                .send(kv)
                .map_err(|_| self.shared.check().unwrap_or(PipeError::Closed)),
            None => Err(self.shared.check().unwrap_or(PipeError::Closed)),
        }
    }
}

/// Reader side of the device-send pipe.
pub struct ChunkReader {
    rx: mpsc::UnboundedReceiver<ServiceInfoKV>,
    pending: Option<ServiceInfoKV>,
    shared: Arc<Shared>,
}

impl ChunkReader {
    /// Pull the next chunk if it fits within `max` serialized bytes.
    ///
    /// A chunk that does not fit is retained and returned by a later call
    /// with a sufficient budget.
    pub async fn read_chunk(&mut self, max: usize) -> Result<ChunkRead, PipeError> {
        let kv = match self.pending.take() {
            Some(kv) => kv,
            None => match self.rx.recv().await {
                Some(kv) => kv,
                None => {
                    return match self.shared.check() {
                        Some(err) => Err(err),
                        None => Ok(ChunkRead::End),
                    };
                }
            },
        };
        if kv.serialized_size() > max {
            self.pending = Some(kv);
            return Ok(ChunkRead::SizeTooSmall);
        }
        Ok(ChunkRead::Chunk(kv))
    }
}

/// Writer side of the owner-receive pipe: whole chunks in.
pub struct ChunkWriter {
    tx: Option<mpsc::Sender<ServiceInfoKV>>,
    shared: Arc<Shared>,
}

impl ChunkWriter {
    /// Push one received chunk; suspends until the dispatcher makes room.
    pub async fn write_chunk(&mut self, kv: ServiceInfoKV) -> Result<(), PipeError> {
        match &self.tx {
            Some(tx) => tx
                .send(kv)
                .await
                .map_err(|_| self.shared.check().unwrap_or(PipeError::Closed)),
            None => Err(self.shared.check().unwrap_or(PipeError::Closed)),
        }
    }

    /// Close normally, signalling end-of-input to the dispatcher.
    pub fn close(&mut self) {
        self.tx = None;
    }

    pub fn close_with_error(&mut self, err: PipeError) {
        self.shared.poison(err);
        self.tx = None;
    }
}

/// Reader side of the owner-receive pipe: reassembled logical messages out.
pub struct UnchunkReader {
    rx: mpsc::Receiver<ServiceInfoKV>,
    pending: Option<ServiceInfoKV>,
    shared: Arc<Shared>,
}

impl UnchunkReader {
    /// Pull the next logical `(key, value)`, concatenating consecutive
    /// chunks that share the same key. Returns `Ok(None)` at end-of-input.
    pub async fn next_service_info(&mut self) -> Result<Option<(String, Vec<u8>)>, PipeError> {
        let first = match self.pending.take() {
            Some(kv) => kv,
            None => match self.rx.recv().await {
                Some(kv) => kv,
                None => {
                    return match self.shared.check() {
                        Some(err) => Err(err),
                        None => Ok(None),
                    };
                }
            },
        };

        let key = first.key;
        let mut value = first.value;
        loop {
            match self.rx.recv().await {
                Some(kv) if kv.key == key => value.extend_from_slice(&kv.value),
                Some(kv) => {
                    self.pending = Some(kv);
                    break;
                }
                None => {
                    if let Some(err) = self.shared.check() {
                        return Err(err);
                    }
                    break;
                }
            }
        }
        Ok(Some((key, value)))
    }
}
