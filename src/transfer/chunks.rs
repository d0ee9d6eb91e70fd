//! Chunked File Transfer
//!
//! ## Responsibilities
//! - **Reading**: Random access to chunk `n` (offset `n * chunk_size`) and a
//!   sequential chunk stream. Both go through [`fill`], so they cut the file
//!   at the same boundaries.
//! - **Framing**: `ChunkFrame`s are bincode-encoded and length-delimited
//!   (`tokio_util`'s `LengthDelimitedCodec`, 4-byte big-endian prefix).
//! - **Reassembly**: `UploadAssembler` spools every `(task, chunk)` pair to its
//!   own part file and later concatenates a task's parts in chunk order into
//!   the destination, swapped in with a rename.

use super::TransferError;
use super::protocol::ChunkFrame;
use crate::tasks::TaskId;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, TryStreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::codec::{Encoder, FramedRead, LengthDelimitedCodec};
use tokio_util::io::StreamReader;

/// Room for the bincode envelope around a chunk's bytes.
const FRAME_OVERHEAD: usize = 64;

/// Gaps named in a `MissingChunks` error.
const MISSING_REPORTED: usize = 16;

/// Reads up to `limit` bytes into `buf`, stopping early only at end of file.
pub async fn fill(file: &mut File, buf: &mut Vec<u8>, limit: u64) -> std::io::Result<usize> {
    buf.clear();
    AsyncReadExt::take(&mut *file, limit).read_to_end(buf).await
}

/// Reads chunk `chunk_number`. Past the end of the file the chunk is empty.
pub async fn read_chunk(path: &Path, chunk_number: u64, chunk_size: u64) -> Result<Vec<u8>, TransferError> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(chunk_number * chunk_size)).await?;

    let mut data = Vec::with_capacity(chunk_size as usize);
    fill(&mut file, &mut data, chunk_size).await?;
    Ok(data)
}

struct ChunkCursor {
    path: PathBuf,
    file: Option<File>,
    task_id: TaskId,
    chunk_number: u64,
    chunk_size: u64,
    chunk_count: u64,
}

async fn next_chunk(mut cursor: ChunkCursor) -> Result<Option<(ChunkFrame, ChunkCursor)>, TransferError> {
    if cursor.chunk_number >= cursor.chunk_count {
        return Ok(None);
    }
    let mut file = match cursor.file.take() {
        Some(file) => file,
        None => File::open(&cursor.path).await?,
    };

    let mut data = Vec::with_capacity(cursor.chunk_size as usize);
    // Chunk 0 of an empty file is sent empty; anywhere else zero bytes means
    // the file shrank and the stream ends short.
    if fill(&mut file, &mut data, cursor.chunk_size).await? == 0 && cursor.chunk_number > 0 {
        return Ok(None);
    }

    let frame = ChunkFrame {
        task_id: cursor.task_id,
        chunk_number: cursor.chunk_number,
        chunk_count: cursor.chunk_count,
        data,
    };
    cursor.file = Some(file);
    cursor.chunk_number += 1;
    Ok(Some((frame, cursor)))
}

/// Streams a file as frames `0..chunk_count`.
pub fn chunk_stream(
    path: PathBuf,
    task_id: TaskId,
    chunk_size: u64,
    chunk_count: u64,
) -> impl Stream<Item = Result<ChunkFrame, TransferError>> + Send {
    let cursor = ChunkCursor {
        path,
        file: None,
        task_id,
        chunk_number: 0,
        chunk_size,
        chunk_count,
    };
    futures::stream::try_unfold(cursor, next_chunk)
}

/// Codec sized for one chunk plus envelope. Longer frames are rejected.
pub fn frame_codec(chunk_size: u64) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(chunk_size as usize + FRAME_OVERHEAD)
        .new_codec()
}

pub fn encode_frame(codec: &mut LengthDelimitedCodec, frame: &ChunkFrame) -> Result<Bytes, TransferError> {
    let payload = bincode::serialize(frame)?;
    let mut buf = BytesMut::with_capacity(payload.len() + 4);
    codec.encode(Bytes::from(payload), &mut buf)?;
    Ok(buf.freeze())
}

/// Turns frames into the byte stream sent over HTTP.
pub fn encode_frames<S>(frames: S, chunk_size: u64) -> impl Stream<Item = Result<Bytes, TransferError>> + Send
where
    S: Stream<Item = Result<ChunkFrame, TransferError>> + Send,
{
    let mut codec = frame_codec(chunk_size);
    frames.map(move |frame| frame.and_then(|frame| encode_frame(&mut codec, &frame)))
}

/// Parses a byte stream back into frames.
pub fn decode_frames<S>(body: S, chunk_size: u64) -> impl Stream<Item = Result<ChunkFrame, TransferError>>
where
    S: Stream<Item = std::io::Result<Bytes>>,
{
    FramedRead::new(StreamReader::new(body), frame_codec(chunk_size))
        .map_err(TransferError::from)
        .and_then(|bytes| {
            futures::future::ready(bincode::deserialize::<ChunkFrame>(&bytes).map_err(TransferError::from))
        })
}

/// Spools uploaded chunks of any number of tasks, in any interleaving.
pub struct UploadAssembler {
    /// Names the spool directory and every temp file this upload creates.
    id: uuid::Uuid,
    dir: PathBuf,
    /// Chunk numbers spooled per task, all below the declared count.
    received: BTreeMap<TaskId, BTreeSet<u64>>,
    /// `chunk_count` carried by a task's first frame.
    declared: BTreeMap<TaskId, u64>,
    /// First reason a task's upload can no longer succeed.
    corrupt: BTreeMap<TaskId, String>,
}

impl UploadAssembler {
    /// Creates a private spool directory below `staging_root`.
    pub async fn new(staging_root: &Path) -> Result<Self, TransferError> {
        let id = uuid::Uuid::new_v4();
        let dir = staging_root.join(id.to_string());
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            id,
            dir,
            received: BTreeMap::new(),
            declared: BTreeMap::new(),
            corrupt: BTreeMap::new(),
        })
    }

    fn part_path(&self, task_id: TaskId, chunk_number: u64) -> PathBuf {
        self.dir.join(format!("{}_{}.part", task_id, chunk_number))
    }

    /// Spools one frame. Frames that make the task's upload impossible mark
    /// it corrupt and are dropped without touching the disk.
    pub async fn accept(&mut self, frame: &ChunkFrame) -> Result<(), TransferError> {
        let task_id = frame.task_id;
        let received = self.received.entry(task_id).or_default();
        let declared = *self.declared.entry(task_id).or_insert(frame.chunk_count);
        if self.corrupt.contains_key(&task_id) {
            return Ok(());
        }

        let problem = if declared != frame.chunk_count {
            Some(format!("chunk count changed from {} to {}", declared, frame.chunk_count))
        } else if frame.chunk_number >= declared {
            Some(format!("chunk {} is beyond the declared {} chunks", frame.chunk_number, declared))
        } else if !received.insert(frame.chunk_number) {
            Some(format!("chunk {} received twice", frame.chunk_number))
        } else {
            None
        };
        if let Some(reason) = problem {
            self.corrupt.insert(task_id, reason);
            return Ok(());
        }

        let path = self.part_path(task_id, frame.chunk_number);
        let mut part = OpenOptions::new().create(true).append(true).open(&path).await?;
        part.write_all(&frame.data).await?;
        part.flush().await?;
        Ok(())
    }

    /// Tasks that sent at least one frame.
    pub fn tasks(&self) -> Vec<TaskId> {
        self.received.keys().copied().collect()
    }

    /// Verifies that exactly chunks `0..N-1` arrived, once each.
    pub fn verify(&self, task_id: TaskId) -> Result<u64, TransferError> {
        if let Some(reason) = self.corrupt.get(&task_id) {
            return Err(TransferError::CorruptUpload {
                task: task_id,
                reason: reason.clone(),
            });
        }

        let received = self.received.get(&task_id).ok_or(TransferError::UnknownTask(task_id))?;
        let expected = self.declared.get(&task_id).copied().unwrap_or_default();
        if expected == 0 {
            return Err(TransferError::CorruptUpload {
                task: task_id,
                reason: "no chunks declared".to_string(),
            });
        }

        // `accept` only keeps numbers below `expected`, so the gap count is
        // exact and listing the first gaps scans at most len + MISSING_REPORTED.
        let count = expected - received.len() as u64;
        if count > 0 {
            let missing = (0..expected)
                .filter(|n| !received.contains(n))
                .take(MISSING_REPORTED)
                .collect();
            return Err(TransferError::MissingChunks {
                task: task_id,
                count,
                missing,
            });
        }
        Ok(expected)
    }

    /// Concatenates a task's parts into `destination`. The file appears there
    /// complete or not at all.
    pub async fn assemble(&self, task_id: TaskId, destination: &Path) -> Result<u64, TransferError> {
        let count = self.verify(task_id)?;

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file_name = destination
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "result".to_string());
        let temp = destination.with_file_name(format!(".{}.{}.{}.upload", file_name, task_id, self.id));

        let written = match self.concatenate(task_id, count, &temp).await {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(e);
            }
        };
        tokio::fs::rename(&temp, destination).await?;

        tracing::debug!("Assembled {} chunks ({} bytes) for task {}", count, written, task_id);
        Ok(written)
    }

    async fn concatenate(&self, task_id: TaskId, count: u64, target: &Path) -> Result<u64, TransferError> {
        let mut out = File::create(target).await?;
        let mut written = 0;
        for chunk_number in 0..count {
            let mut part = File::open(self.part_path(task_id, chunk_number)).await?;
            written += tokio::io::copy(&mut part, &mut out).await?;
        }
        out.flush().await?;
        out.sync_all().await?;
        Ok(written)
    }

    /// Removes the spool directory.
    pub async fn cleanup(self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.dir).await {
            tracing::warn!("Failed to remove upload staging {}: {}", self.dir.display(), e);
        }
    }
}
