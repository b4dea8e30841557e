//! Need-list application and the transfer parts that carry it.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::SeekFrom;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use super::needlist::NeedListItem;
use crate::error::{Result, SyncError};

/// Largest `Data` part produced from one read.
pub const DATA_CHUNK_SIZE: usize = 256 * 1024;

/// Parts buffered between a transfer producer and its consumer.
pub const PART_CHANNEL_SIZE: usize = 64;

/// Unit of a streamed content transfer.
///
/// In need-list mode every `Source` part is followed by `Data` parts adding
/// up to its length. In byte mode the stream is `Data` parts only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferPart {
    Seed { offset: u64, length: u64 },
    Source { offset: u64, length: u64 },
    Data(Bytes),
}

pub type PartSender = mpsc::Sender<Result<TransferPart>>;
pub type PartReceiver = mpsc::Receiver<Result<TransferPart>>;

pub fn part_channel() -> (PartSender, PartReceiver) {
    mpsc::channel(PART_CHANNEL_SIZE)
}

/// Counters observed while applying a transfer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransferStats {
    pub bytes_copied: u64,
    pub bytes_transferred: u64,
    pub need_list_length: u64,
}

/// Forward-only random access to source content.
#[async_trait]
pub trait SourceAccess: Send {
    /// Read up to `max` bytes at `offset`. An empty result means end of
    /// content. Offsets must never move backwards between calls.
    async fn read_at(&mut self, offset: u64, max: usize) -> Result<Bytes>;
}

/// [`SourceAccess`] over a sequential reader. Gaps are skipped by reading.
pub struct ForwardReader<R> {
    inner: R,
    position: u64,
}

impl<R> ForwardReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, position: 0 }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> SourceAccess for ForwardReader<R> {
    async fn read_at(&mut self, offset: u64, max: usize) -> Result<Bytes> {
        if offset < self.position {
            return Err(SyncError::Transfer(format!(
                "Backward read at {} from forward-only source at {}",
                offset, self.position
            )));
        }
        if offset > self.position {
            let gap = offset - self.position;
            let skipped =
                tokio::io::copy(&mut (&mut self.inner).take(gap), &mut tokio::io::sink()).await?;
            self.position += skipped;
            if skipped < gap {
                return Ok(Bytes::new());
            }
        }

        let mut buffer = vec![0u8; max];
        let mut filled = 0;
        while filled < max {
            let n = self.inner.read(&mut buffer[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buffer.truncate(filled);
        self.position += filled as u64;
        Ok(Bytes::from(buffer))
    }
}

/// Rebuilds content into `output` from seed ranges and streamed source data.
///
/// Seed reads may seek anywhere; source data must arrive in increasing offset
/// order and is never buffered beyond the part being written.
pub struct NeedListWriter<S, W> {
    seed: Option<S>,
    output: W,
    raw: bool,
    stats: TransferStats,
    source_position: u64,
    pending_source: u64,
}

impl<S, W> NeedListWriter<S, W>
where
    S: AsyncRead + AsyncSeek + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Writer for need-list coded transfers.
    pub fn new(seed: Option<S>, output: W) -> Self {
        Self {
            seed,
            output,
            raw: false,
            stats: TransferStats::default(),
            source_position: 0,
            pending_source: 0,
        }
    }

    /// Writer for plain byte transfers: `Data` parts only.
    pub fn raw(output: W) -> Self {
        Self {
            raw: true,
            ..Self::new(None, output)
        }
    }

    pub fn stats(&self) -> TransferStats {
        self.stats
    }

    fn ensure_no_pending_source(&self) -> Result<()> {
        if self.pending_source > 0 {
            return Err(SyncError::Transfer(format!(
                "Source range ended {} bytes short",
                self.pending_source
            )));
        }
        Ok(())
    }

    pub async fn copy_seed(&mut self, offset: u64, length: u64) -> Result<()> {
        if self.raw {
            return Err(SyncError::Protocol("Seed range in a byte transfer".into()));
        }
        self.ensure_no_pending_source()?;
        let seed = self.seed.as_mut().ok_or_else(|| {
            SyncError::Transfer("Seed range requested but there is no seed content".into())
        })?;

        seed.seek(SeekFrom::Start(offset)).await?;
        let copied = tokio::io::copy(&mut seed.take(length), &mut self.output).await?;
        if copied != length {
            return Err(SyncError::Transfer(format!(
                "Seed ended after {} of {} bytes at offset {}",
                copied, length, offset
            )));
        }

        self.stats.bytes_copied += length;
        self.stats.need_list_length += 1;
        Ok(())
    }

    pub fn begin_source(&mut self, offset: u64, length: u64) -> Result<()> {
        if self.raw {
            return Err(SyncError::Protocol("Source range in a byte transfer".into()));
        }
        self.ensure_no_pending_source()?;
        if offset < self.source_position {
            return Err(SyncError::Transfer(format!(
                "Source range at {} goes backwards (already at {})",
                offset, self.source_position
            )));
        }

        self.source_position = offset + length;
        self.pending_source = length;
        self.stats.need_list_length += 1;
        Ok(())
    }

    pub async fn write_data(&mut self, data: &[u8]) -> Result<()> {
        let len = data.len() as u64;
        if !self.raw {
            if len > self.pending_source {
                return Err(SyncError::Transfer(format!(
                    "Received {} data bytes but only {} were announced",
                    len, self.pending_source
                )));
            }
            self.pending_source -= len;
        }
        self.output.write_all(data).await?;
        self.stats.bytes_transferred += len;
        Ok(())
    }

    pub async fn apply_part(&mut self, part: TransferPart) -> Result<()> {
        match part {
            TransferPart::Seed { offset, length } => self.copy_seed(offset, length).await,
            TransferPart::Source { offset, length } => self.begin_source(offset, length),
            TransferPart::Data(data) => self.write_data(&data).await,
        }
    }

    /// Flush and hand back the output.
    pub async fn finish(mut self) -> Result<(W, TransferStats)> {
        self.ensure_no_pending_source()?;
        self.output.flush().await?;
        Ok((self.output, self.stats))
    }
}

/// Write the content described by `need_list` to `output`.
///
/// Seed items are copied from `seed`; source items are read from `source` in
/// list order, which is increasing offset order for lists produced by
/// [`create_need_list`](super::create_need_list).
pub async fn apply_need_list<S, W>(
    need_list: &[NeedListItem],
    seed: Option<S>,
    source: &mut dyn SourceAccess,
    output: W,
) -> Result<(W, TransferStats)>
where
    S: AsyncRead + AsyncSeek + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut writer = NeedListWriter::new(seed, output);
    for item in need_list {
        match *item {
            NeedListItem::Seed { offset, length } => writer.copy_seed(offset, length).await?,
            NeedListItem::Source { offset, length } => {
                writer.begin_source(offset, length)?;
                let mut done = 0u64;
                while done < length {
                    let want = (length - done).min(DATA_CHUNK_SIZE as u64) as usize;
                    let data = source.read_at(offset + done, want).await?;
                    if data.is_empty() {
                        return Err(SyncError::Transfer(format!(
                            "Source ended at {} while {} bytes were needed",
                            offset + done,
                            length - done
                        )));
                    }
                    writer.write_data(&data).await?;
                    done += data.len() as u64;
                }
            }
        }
    }
    writer.finish().await
}

/// Stream `need_list` as transfer parts, reading source ranges from
/// `source`. Returns the number of parts that carried need-list items.
pub async fn send_need_list(
    need_list: &[NeedListItem],
    source: &mut dyn SourceAccess,
    tx: &PartSender,
) -> Result<u64> {
    for item in need_list {
        match *item {
            NeedListItem::Seed { offset, length } => {
                send(tx, TransferPart::Seed { offset, length }).await?;
            }
            NeedListItem::Source { offset, length } => {
                send(tx, TransferPart::Source { offset, length }).await?;
                let mut done = 0u64;
                while done < length {
                    let want = (length - done).min(DATA_CHUNK_SIZE as u64) as usize;
                    let data = source.read_at(offset + done, want).await?;
                    if data.is_empty() {
                        return Err(SyncError::Transfer(format!(
                            "Local content ended at {} while {} bytes were needed",
                            offset + done,
                            length - done
                        )));
                    }
                    done += data.len() as u64;
                    send(tx, TransferPart::Data(data)).await?;
                }
            }
        }
    }
    Ok(need_list.len() as u64)
}

/// Stream everything `reader` yields as `Data` parts.
pub async fn send_bytes<R: AsyncRead + Unpin + Send>(reader: R, tx: &PartSender) -> Result<u64> {
    let mut source = ForwardReader::new(reader);
    let mut offset = 0u64;
    loop {
        let data = source.read_at(offset, DATA_CHUNK_SIZE).await?;
        if data.is_empty() {
            return Ok(offset);
        }
        offset += data.len() as u64;
        send(tx, TransferPart::Data(data)).await?;
    }
}

async fn send(tx: &PartSender, part: TransferPart) -> Result<()> {
    tx.send(Ok(part))
        .await
        .map_err(|_| SyncError::Transfer("Transfer receiver closed".into()))
}
