//! Single-consumer chunk streams.
//!
//! Each stream is a bounded channel with one writer and one reader. The
//! reader is parked in the registry until a consumer claims it; it can be
//! claimed once. A stream that ends without a final chunk (writer dropped,
//! expiry or bus shutdown) yields [`WoodworkError::StreamTruncated`] after
//! the buffered chunks, so a consumer never waits forever.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use woodwork_common::error::{Result, WoodworkError};
use woodwork_common::types::StreamId;

use crate::component::{ChunkWriter, Payload};

/// One piece of a streamed result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamChunk {
    /// Stream the chunk belongs to.
    pub stream: StreamId,
    /// Position in the stream, starting at 0.
    pub seq: u64,
    /// Chunk body.
    pub data: Payload,
    /// Marks the last chunk.
    pub is_final: bool,
}

struct StreamSlot {
    reader: Option<StreamReader>,
    finished: Arc<AtomicBool>,
    cancel: CancellationToken,
    opened_at: Instant,
}

/// Open streams keyed by id.
#[derive(Default)]
pub struct StreamRegistry {
    slots: Mutex<HashMap<StreamId, StreamSlot>>,
}

impl std::fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRegistry")
            .field("open", &self.len())
            .finish()
    }
}

impl StreamRegistry {
    fn slots(&self) -> MutexGuard<'_, HashMap<StreamId, StreamSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a stream buffering up to `capacity` chunks.
    pub fn open(&self, capacity: usize) -> StreamWriter {
        let id = StreamId::generate();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let finished = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let reader = StreamReader {
            id: id.clone(),
            rx,
            cancel: cancel.clone(),
            closing: false,
            done: false,
        };
        let _ = self.slots().insert(
            id.clone(),
            StreamSlot {
                reader: Some(reader),
                finished: Arc::clone(&finished),
                cancel,
                opened_at: Instant::now(),
            },
        );
        tracing::trace!(stream = %id, capacity, "stream opened");
        StreamWriter {
            id,
            tx,
            seq: 0,
            finished,
        }
    }

    /// Claims the reader of `id`.
    ///
    /// # Errors
    ///
    /// Returns [`WoodworkError::NotFound`] for unknown streams, or a runtime
    /// error if the reader was already claimed.
    pub fn take_reader(&self, id: &StreamId) -> Result<StreamReader> {
        let mut slots = self.slots();
        let slot = slots.get_mut(id).ok_or_else(|| WoodworkError::NotFound {
            kind: "stream",
            id: id.to_string(),
        })?;
        slot.reader
            .take()
            .ok_or_else(|| WoodworkError::runtime(format!("stream {id} already has a reader")))
    }

    /// Removes streams past `ttl`, and finished streams whose reader was
    /// claimed. Expired unfinished streams are truncated. Returns how many
    /// were removed.
    pub fn cleanup(&self, now: Instant, ttl: Duration) -> usize {
        let mut slots = self.slots();
        let before = slots.len();
        slots.retain(|id, slot| {
            let expired = now.duration_since(slot.opened_at) > ttl;
            let finished = slot.finished.load(Ordering::Acquire);
            if expired && !finished {
                tracing::warn!(stream = %id, "stream expired before its final chunk");
                slot.cancel.cancel();
            }
            !(expired || (finished && slot.reader.is_none()))
        });
        before - slots.len()
    }

    /// Truncates and forgets every open stream. Returns how many were open.
    pub fn truncate_all(&self) -> usize {
        let mut slots = self.slots();
        let mut truncated = 0;
        for (id, slot) in slots.drain() {
            if !slot.finished.load(Ordering::Acquire) {
                tracing::warn!(stream = %id, "stream truncated by shutdown");
                truncated += 1;
            }
            slot.cancel.cancel();
        }
        truncated
    }

    /// Number of tracked streams.
    pub fn len(&self) -> usize {
        self.slots().len()
    }

    /// Returns `true` if no stream is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Producing half of a stream.
#[derive(Debug)]
pub struct StreamWriter {
    id: StreamId,
    tx: mpsc::Sender<StreamChunk>,
    seq: u64,
    finished: Arc<AtomicBool>,
}

impl StreamWriter {
    /// Stream identifier.
    #[must_use]
    pub const fn id(&self) -> &StreamId {
        &self.id
    }

    fn next_chunk(&mut self, data: Payload, is_final: bool) -> Result<StreamChunk> {
        if self.finished.load(Ordering::Acquire) {
            return Err(WoodworkError::runtime(format!("stream {} already finished", self.id)));
        }
        let chunk = StreamChunk {
            stream: self.id.clone(),
            seq: self.seq,
            data,
            is_final,
        };
        self.seq += 1;
        Ok(chunk)
    }

    fn closed(&self) -> WoodworkError {
        WoodworkError::runtime(format!("stream {} is closed", self.id))
    }

    /// Sends one chunk, waiting for buffer space.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream already finished or was closed.
    pub async fn write(&mut self, data: Payload, is_final: bool) -> Result<()> {
        let chunk = self.next_chunk(data, is_final)?;
        self.tx.send(chunk).await.map_err(|_| self.closed())?;
        if is_final {
            self.finished.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Sends one chunk from a blocking worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream already finished or was closed.
    pub fn blocking_write(&mut self, data: Payload, is_final: bool) -> Result<()> {
        let chunk = self.next_chunk(data, is_final)?;
        self.tx.blocking_send(chunk).map_err(|_| self.closed())?;
        if is_final {
            self.finished.store(true, Ordering::Release);
        }
        Ok(())
    }
}

/// Writes every chunk to several streams. Used from blocking workers.
///
/// A stream whose reader went away is dropped from the set; the others keep
/// receiving. Writing fails only once no stream is left.
#[derive(Debug, Default)]
pub struct FanOutWriter {
    writers: Vec<StreamWriter>,
}

impl FanOutWriter {
    /// Fans out to `writers`.
    #[must_use]
    pub const fn new(writers: Vec<StreamWriter>) -> Self {
        Self { writers }
    }
}

impl ChunkWriter for FanOutWriter {
    fn write_chunk(&mut self, chunk: Payload, is_final: bool) -> Result<()> {
        if self.writers.is_empty() {
            return Err(WoodworkError::runtime("no open output stream"));
        }
        let mut last_error = None;
        self.writers
            .retain_mut(|writer| match writer.blocking_write(chunk.clone(), is_final) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(stream = %writer.id(), error = %e, "stream left the fan-out");
                    last_error = Some(e);
                    false
                }
            });
        match last_error {
            Some(e) if self.writers.is_empty() => Err(e),
            _ => Ok(()),
        }
    }
}

/// Consuming half of a stream.
#[derive(Debug)]
pub struct StreamReader {
    id: StreamId,
    rx: mpsc::Receiver<StreamChunk>,
    cancel: CancellationToken,
    closing: bool,
    done: bool,
}

impl StreamReader {
    /// Stream identifier.
    #[must_use]
    pub const fn id(&self) -> &StreamId {
        &self.id
    }

    /// Waits for the next chunk.
    ///
    /// Returns `None` after the final chunk or after the truncation error.
    pub async fn next_chunk(&mut self) -> Option<Result<StreamChunk>> {
        if self.done {
            return None;
        }
        let received = if self.closing {
            self.rx.recv().await
        } else {
            tokio::select! {
                biased;
                chunk = self.rx.recv() => chunk,
                () = self.cancel.cancelled() => {
                    self.closing = true;
                    self.rx.close();
                    self.rx.recv().await
                }
            }
        };
        match received {
            Some(chunk) => {
                self.done = chunk.is_final;
                Some(Ok(chunk))
            }
            None => {
                self.done = true;
                tracing::warn!(stream = %self.id, "stream ended without a final chunk");
                Some(Err(WoodworkError::StreamTruncated {
                    stream: self.id.to_string(),
                }))
            }
        }
    }

    /// Reads the stream to its end.
    ///
    /// # Errors
    ///
    /// Returns [`WoodworkError::StreamTruncated`] if no final chunk arrived.
    pub async fn collect(mut self) -> Result<Vec<StreamChunk>> {
        let mut chunks = Vec::new();
        while let Some(next) = self.next_chunk().await {
            chunks.push(next?);
        }
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn chunks_arrive_in_order_and_end_at_final() {
        let registry = StreamRegistry::default();
        let mut writer = registry.open(8);
        let reader = registry.take_reader(writer.id()).expect("reader");

        for i in 0..5 {
            writer.write(json!(i), i == 4).await.expect("write");
        }
        let chunks = reader.collect().await.expect("complete stream");
        let data: Vec<_> = chunks.iter().map(|c| c.data.clone()).collect();
        assert_eq!(data, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);
        let seqs: Vec<_> = chunks.iter().map(|c| c.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn reader_is_claimed_once() {
        let registry = StreamRegistry::default();
        let writer = registry.open(1);
        registry.take_reader(writer.id()).expect("first claim");
        assert!(registry.take_reader(writer.id()).is_err());
        assert!(matches!(
            registry.take_reader(&StreamId::new("ghost")),
            Err(WoodworkError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn dropped_writer_truncates_after_buffered_chunks() {
        let registry = StreamRegistry::default();
        let mut writer = registry.open(4);
        let mut reader = registry.take_reader(writer.id()).expect("reader");
        writer.write(json!("partial"), false).await.expect("write");
        drop(writer);

        let first = reader.next_chunk().await.expect("chunk").expect("ok");
        assert_eq!(first.data, json!("partial"));
        assert!(matches!(
            reader.next_chunk().await,
            Some(Err(WoodworkError::StreamTruncated { .. }))
        ));
        assert!(reader.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn truncate_all_wakes_waiting_reader() {
        let registry = Arc::new(StreamRegistry::default());
        let mut writer = registry.open(4);
        let mut reader = registry.take_reader(writer.id()).expect("reader");
        writer.write(json!("a"), false).await.expect("write");

        let waiting = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(next) = reader.next_chunk().await {
                seen.push(next.map(|c| c.data));
            }
            seen
        });
        tokio::task::yield_now().await;
        assert_eq!(registry.truncate_all(), 1);

        let seen = waiting.await.expect("join");
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].as_ref().expect("buffered chunk"), &json!("a"));
        assert!(matches!(seen[1], Err(WoodworkError::StreamTruncated { .. })));
        drop(writer);
    }

    #[tokio::test]
    async fn fan_out_keeps_writing_when_one_reader_leaves() {
        let registry = StreamRegistry::default();
        let (gone, kept) = (registry.open(1), registry.open(8));
        drop(registry.take_reader(gone.id()).expect("reader"));
        let reader = registry.take_reader(kept.id()).expect("reader");

        let written = tokio::task::spawn_blocking(move || {
            let mut fan_out = FanOutWriter::new(vec![gone, kept]);
            fan_out.write_chunk(json!("a"), false)?;
            fan_out.write_chunk(json!("b"), true)
        })
        .await
        .expect("join");
        assert!(written.is_ok(), "{written:?}");

        let data: Vec<_> = reader
            .collect()
            .await
            .expect("complete stream")
            .into_iter()
            .map(|c| c.data)
            .collect();
        assert_eq!(data, vec![json!("a"), json!("b")]);
    }

    #[tokio::test]
    async fn fan_out_fails_once_every_reader_left() {
        let registry = StreamRegistry::default();
        let writer = registry.open(1);
        drop(registry.take_reader(writer.id()).expect("reader"));
        let written = tokio::task::spawn_blocking(move || {
            FanOutWriter::new(vec![writer]).write_chunk(json!("a"), true)
        })
        .await
        .expect("join");
        assert!(written.is_err());
    }

    #[tokio::test]
    async fn writing_after_final_fails() {
        let registry = StreamRegistry::default();
        let mut writer = registry.open(4);
        writer.write(json!("done"), true).await.expect("final");
        assert!(writer.write(json!("late"), false).await.is_err());
    }

    #[tokio::test]
    async fn cleanup_removes_finished_claimed_and_expired_streams() {
        let registry = StreamRegistry::default();
        let mut finished = registry.open(2);
        let _reader = registry.take_reader(finished.id()).expect("reader");
        finished.write(json!(1), true).await.expect("final");
        let _stale = registry.open(2);
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.cleanup(Instant::now(), Duration::from_secs(60)), 1);
        assert_eq!(registry.len(), 1);

        let later = Instant::now() + Duration::from_secs(120);
        assert_eq!(registry.cleanup(later, Duration::from_secs(60)), 1);
        assert!(registry.is_empty());
    }
}
