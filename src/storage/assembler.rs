//! Chunk transfer against the channel transport.
//!
//! Uploads read the source one chunk at a time, hash it on the way through and
//! keep a bounded number of sends in flight. Downloads fetch ahead within a
//! window but always yield chunks in sequence order.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{self, BoxStream, FuturesUnordered, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use super::cas::{ChunkReference, ContentHasher};
use super::planner::ChunkPlan;
use crate::config::{RetryConfig, StorageConfig};
use crate::transport::{ChannelTransport, RemoteMessageId, TransportError};
use crate::{DriveError, Result};

/// Ordered stream of chunk payloads.
///
/// The stream ends after the first error, which carries the failing chunk's
/// index via [`DriveError::chunk_index`].
pub type ChunkStream = BoxStream<'static, Result<Vec<u8>>>;

/// Chunk sends in flight during an upload.
type InFlight<'a> = FuturesUnordered<BoxFuture<'a, Result<ChunkReference>>>;

/// Bounded exponential backoff for transient transport failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    /// Create a policy. `max_attempts` counts the first try.
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff,
        }
    }

    /// Create a policy from configuration.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        )
    }

    /// Attempts per chunk, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    async fn run<T, F, Fut>(&self, index: u32, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, TransportError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(TransportError::Unavailable(msg)) if attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "Chunk {} attempt {}/{} unavailable ({}), retrying in {:?}",
                        index, attempt, self.max_attempts, msg, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(DriveError::chunk(index, e.into())),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Result of a completed upload: nothing is catalogued yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedBlob {
    /// SHA-256 of the bytes read, lowercase hex.
    pub checksum: String,
    /// Bytes read.
    pub size: u64,
    /// Sent chunks in sequence order.
    pub chunks: Vec<ChunkReference>,
}

impl UploadedBlob {
    /// Remote identifiers of every chunk.
    pub fn remote_ids(&self) -> Vec<RemoteMessageId> {
        self.chunks.iter().map(|c| c.remote_id.clone()).collect()
    }
}

/// Moves blobs to and from the channel transport.
#[derive(Clone)]
pub struct BlobAssembler {
    transport: Arc<dyn ChannelTransport>,
    retry: RetryPolicy,
    upload_window: usize,
    download_window: usize,
}

impl BlobAssembler {
    /// Create an assembler with a window of 1 in each direction.
    pub fn new(transport: Arc<dyn ChannelTransport>, retry: RetryPolicy) -> Self {
        Self {
            transport,
            retry,
            upload_window: 1,
            download_window: 1,
        }
    }

    /// Create an assembler from the storage configuration.
    pub fn from_config(transport: Arc<dyn ChannelTransport>, config: &StorageConfig) -> Self {
        Self::new(transport, RetryPolicy::from_config(&config.retry))
            .with_windows(config.upload_concurrency, config.download_concurrency)
    }

    /// Set the number of chunks in flight for uploads and downloads.
    pub fn with_windows(mut self, upload: usize, download: usize) -> Self {
        self.upload_window = upload.max(1);
        self.download_window = download.max(1);
        self
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Arc<dyn ChannelTransport> {
        &self.transport
    }

    /// Upload `reader` according to `plan`.
    ///
    /// The reader must yield exactly `plan.total_size()` bytes. On any error
    /// the chunks already sent are deleted from the transport (best-effort)
    /// before returning; if the returned future is dropped instead, the same
    /// cleanup is spawned onto the runtime.
    pub async fn upload<R>(&self, reader: R, plan: &ChunkPlan) -> Result<UploadedBlob>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut guard = AbandonGuard::new(Arc::clone(&self.transport));
        let mut in_flight = InFlight::new();
        match self
            .upload_chunks(reader, plan, &mut in_flight, &mut guard)
            .await
        {
            Ok(blob) => {
                guard.disarm();
                Ok(blob)
            }
            Err(e) => {
                // Sends still running may land in the channel after the failure
                while let Some(sent) = in_flight.next().await {
                    if let Ok(chunk) = sent {
                        guard.track(chunk.remote_id);
                    }
                }
                let ids = guard.take();
                if !ids.is_empty() {
                    warn!("Upload failed ({}), abandoning {} sent chunks", e, ids.len());
                    self.discard(&ids).await;
                }
                Err(e)
            }
        }
    }

    async fn upload_chunks<'a, R>(
        &'a self,
        mut reader: R,
        plan: &'a ChunkPlan,
        in_flight: &mut InFlight<'a>,
        guard: &mut AbandonGuard,
    ) -> Result<UploadedBlob>
    where
        R: AsyncRead + Unpin + Send,
    {
        let declared = plan.total_size();
        let tier = plan.tier().name.as_str();
        let mut hasher = ContentHasher::new();
        let mut chunks = Vec::with_capacity(plan.chunk_count() as usize);

        for index in 0..plan.chunk_count() {
            let expected = plan.chunk_len(index);
            let read = read_chunk(&mut reader, expected);
            let data = while_sending(read, in_flight, guard, &mut chunks).await?;
            if (data.len() as u64) < expected {
                return Err(DriveError::SizeMismatch {
                    declared,
                    actual: hasher.bytes_hashed() + data.len() as u64,
                });
            }
            hasher.update(&data);

            while in_flight.len() >= self.upload_window {
                if let Some(result) = in_flight.next().await {
                    let chunk = result?;
                    guard.track(chunk.remote_id.clone());
                    chunks.push(chunk);
                }
            }
            in_flight.push(self.send_chunk(tier, index, data).boxed());
        }

        let trailing =
            while_sending(read_chunk(&mut reader, 1), in_flight, guard, &mut chunks).await?;
        if !trailing.is_empty() {
            return Err(DriveError::SizeMismatch {
                declared,
                actual: declared + 1,
            });
        }

        while let Some(result) = in_flight.next().await {
            let chunk = result?;
            guard.track(chunk.remote_id.clone());
            chunks.push(chunk);
        }
        chunks.sort_by_key(|c| c.seq);

        Ok(UploadedBlob {
            checksum: hasher.finalize(),
            size: declared,
            chunks,
        })
    }

    async fn send_chunk(&self, tier: &str, index: u32, data: Vec<u8>) -> Result<ChunkReference> {
        let remote_id = self
            .retry
            .run(index, || self.transport.send(tier, &data))
            .await?;
        debug!(
            "Sent chunk {} ({} bytes) on {} as {}",
            index,
            data.len(),
            tier,
            remote_id
        );
        Ok(ChunkReference {
            seq: index,
            remote_id,
            length: data.len() as u64,
            tier: tier.to_string(),
        })
    }

    /// Delete messages from the transport, logging failures.
    pub async fn discard(&self, ids: &[RemoteMessageId]) {
        discard_all(self.transport.as_ref(), ids).await;
    }

    /// Stream the blob made of `chunks`, starting at sequence index `start`.
    ///
    /// Nothing is fetched until the stream is polled. Re-calling with the
    /// index of a failed chunk resumes the download from there.
    pub fn download(&self, chunks: Vec<ChunkReference>, start: u32) -> ChunkStream {
        let transport = Arc::clone(&self.transport);
        let retry = self.retry.clone();

        stream::iter(chunks.into_iter().skip(start as usize))
            .map(move |chunk| {
                let transport = Arc::clone(&transport);
                let retry = retry.clone();
                async move { fetch_chunk(transport.as_ref(), &retry, chunk).await }
            })
            .buffered(self.download_window)
            .scan(false, |failed, item| {
                if *failed {
                    return future::ready(None);
                }
                *failed = item.is_err();
                future::ready(Some(item))
            })
            .boxed()
    }
}

/// Read up to `len` bytes; fewer only at end of stream.
async fn read_chunk<R>(reader: &mut R, len: u64) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut data = Vec::with_capacity(len as usize);
    reader.take(len).read_to_end(&mut data).await?;
    Ok(data)
}

/// Await `fut` while sends already in flight keep completing.
async fn while_sending<T, F, S>(
    fut: F,
    in_flight: &mut S,
    guard: &mut AbandonGuard,
    chunks: &mut Vec<ChunkReference>,
) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
    S: Stream<Item = Result<ChunkReference>> + Unpin,
{
    tokio::pin!(fut);
    loop {
        tokio::select! {
            biased;
            out = &mut fut => return out,
            Some(sent) = in_flight.next() => {
                let chunk = sent?;
                guard.track(chunk.remote_id.clone());
                chunks.push(chunk);
            }
        }
    }
}

async fn fetch_chunk(
    transport: &dyn ChannelTransport,
    retry: &RetryPolicy,
    chunk: ChunkReference,
) -> Result<Vec<u8>> {
    let data = retry
        .run(chunk.seq, || transport.fetch(&chunk.remote_id))
        .await?;
    if data.len() as u64 != chunk.length {
        return Err(DriveError::chunk(
            chunk.seq,
            DriveError::SizeMismatch {
                declared: chunk.length,
                actual: data.len() as u64,
            },
        ));
    }
    debug!("Fetched chunk {} ({} bytes)", chunk.seq, data.len());
    Ok(data)
}

async fn discard_all(transport: &dyn ChannelTransport, ids: &[RemoteMessageId]) {
    for id in ids {
        if let Err(e) = transport.delete(id).await {
            warn!("Failed to delete remote message {}: {}", id, e);
        }
    }
}

/// Concatenate a chunk stream into one buffer.
pub async fn collect_bytes(mut stream: ChunkStream) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

/// Remembers sent chunks so a dropped upload does not leak them.
struct AbandonGuard {
    transport: Arc<dyn ChannelTransport>,
    sent: Vec<RemoteMessageId>,
}

impl AbandonGuard {
    fn new(transport: Arc<dyn ChannelTransport>) -> Self {
        Self {
            transport,
            sent: Vec::new(),
        }
    }

    fn track(&mut self, id: RemoteMessageId) {
        self.sent.push(id);
    }

    fn take(&mut self) -> Vec<RemoteMessageId> {
        std::mem::take(&mut self.sent)
    }

    fn disarm(mut self) {
        self.sent.clear();
    }
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        if self.sent.is_empty() {
            return;
        }
        let ids = std::mem::take(&mut self.sent);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Upload cancelled, abandoning {} sent chunks", ids.len());
                let transport = Arc::clone(&self.transport);
                handle.spawn(async move { discard_all(transport.as_ref(), &ids).await });
            }
            Err(_) => warn!("Upload cancelled outside a runtime, {} chunks orphaned", ids.len()),
        }
    }
}
