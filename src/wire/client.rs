//! Client side of the protocol: a [`SyncDestination`] that opens one
//! connection per request.

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use super::message::{Request, Response, ServerStatus};
use super::protocol::{
    decode_json, encode_json, encode_part, encode_parts_end, read_frame, write_frame, Abort,
    Fatal, Hello, HelloFlags, MessageType,
};
use crate::conflict::{ConflictItem, ConflictResolutionStrategy};
use crate::destination::{DestinationResolver, FileRequest, SyncDestination, TransferMode};
use crate::error::{Result, SyncError};
use crate::history::HistoryItem;
use crate::metadata::Metadata;
use crate::queue::SynchronizationDetails;
use crate::rdc::{part_channel, send_bytes, PartReceiver, SignatureManifest};
use crate::report::{
    ListPage, Paging, SourceInfo, SourceSynchronizationInformation, SynchronizationConfirmation,
    SynchronizationReport,
};
use crate::tag::{Etag, ServerId};

/// Opens byte streams to peers by address.
#[async_trait]
pub trait Connect: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn connect(&self, address: &str) -> Result<Self::Stream>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connect for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, address: &str) -> Result<TcpStream> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| SyncError::Transfer(format!("Cannot connect to {}: {}", address, e)))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Stream faults: the peer went away or sent garbage mid-exchange.
fn wire_error(e: anyhow::Error) -> SyncError {
    SyncError::Transfer(format!("{:#}", e))
}

fn protocol_error(e: anyhow::Error) -> SyncError {
    SyncError::Protocol(format!("{:#}", e))
}

async fn read_response<R: AsyncRead + Unpin>(reader: &mut R, url: &str) -> Result<Response> {
    let (msg_type, payload) = read_frame(reader).await.map_err(wire_error)?;
    match msg_type {
        MessageType::Response => decode_json(payload).map_err(protocol_error),
        MessageType::Fatal => {
            let fatal = Fatal::decode(payload).map_err(protocol_error)?;
            Err(SyncError::Protocol(format!(
                "{} rejected the request: {}",
                url, fatal.message
            )))
        }
        other => Err(SyncError::Protocol(format!(
            "Expected RESPONSE from {}, got {:?}",
            url, other
        ))),
    }
}

/// Write every part, then PARTS_END. A failed producer ends the stream with
/// ABORT instead.
async fn send_parts<W: AsyncWrite + Unpin>(
    writer: &mut W,
    parts: &mut PartReceiver,
    compression: bool,
) -> Result<()> {
    while let Some(part) = parts.recv().await {
        let frame = match part {
            Ok(part) => encode_part(&part, compression).map_err(protocol_error)?,
            Err(e) => {
                let abort = Abort {
                    message: e.to_string(),
                };
                write_frame(writer, &abort.encode()).await.map_err(wire_error)?;
                writer.flush().await?;
                return Ok(());
            }
        };
        write_frame(writer, &frame).await.map_err(wire_error)?;
    }
    write_frame(writer, &encode_parts_end())
        .await
        .map_err(wire_error)?;
    writer.flush().await?;
    Ok(())
}

struct Session<S> {
    stream: S,
    compression: bool,
}

/// A peer reached through framed connections.
pub struct RemoteDestination<C: Connect = TcpConnector> {
    url: String,
    connector: Arc<C>,
    /// Announced in HELLO so the peer can tell who is calling
    local_url: String,
    compression: bool,
}

impl<C: Connect> RemoteDestination<C> {
    pub fn new(url: impl Into<String>, connector: Arc<C>) -> Self {
        Self {
            url: url.into(),
            connector,
            local_url: String::new(),
            compression: true,
        }
    }

    pub fn with_local_url(mut self, local_url: impl Into<String>) -> Self {
        self.local_url = local_url.into();
        self
    }

    pub fn with_compression(mut self, compression: bool) -> Self {
        self.compression = compression;
        self
    }

    async fn open(&self) -> Result<Session<C::Stream>> {
        let mut stream = self.connector.connect(&self.url).await?;

        let flags = if self.compression {
            HelloFlags::COMPRESSION
        } else {
            HelloFlags::empty()
        };
        write_frame(&mut stream, &Hello::new(flags, self.local_url.as_str()).encode())
            .await
            .map_err(wire_error)?;
        stream.flush().await?;

        let (msg_type, payload) = read_frame(&mut stream).await.map_err(wire_error)?;
        let hello = match msg_type {
            MessageType::Hello => Hello::decode(payload).map_err(protocol_error)?,
            MessageType::Fatal => {
                let fatal = Fatal::decode(payload).map_err(protocol_error)?;
                return Err(SyncError::Protocol(format!(
                    "{} refused the connection: {}",
                    self.url, fatal.message
                )));
            }
            other => {
                return Err(SyncError::Protocol(format!(
                    "Expected HELLO from {}, got {:?}",
                    self.url, other
                )))
            }
        };

        Ok(Session {
            stream,
            compression: self.compression && hello.compression(),
        })
    }

    async fn call<T: DeserializeOwned>(&self, request: &Request) -> Result<T> {
        let mut session = self.open().await?;
        let frame = encode_json(MessageType::Request, request).map_err(protocol_error)?;
        write_frame(&mut session.stream, &frame)
            .await
            .map_err(wire_error)?;
        session.stream.flush().await?;

        read_response(&mut session.stream, &self.url)
            .await?
            .into_result()
    }

    /// Send `request` followed by `parts`. The peer may answer before all
    /// parts are sent, in which case sending stops.
    async fn call_with_parts<T: DeserializeOwned>(
        &self,
        request: &Request,
        mut parts: PartReceiver,
    ) -> Result<T> {
        let session = self.open().await?;
        let compression = session.compression;
        let (mut reader, mut writer) = tokio::io::split(session.stream);

        let frame = encode_json(MessageType::Request, request).map_err(protocol_error)?;
        write_frame(&mut writer, &frame).await.map_err(wire_error)?;

        let send = send_parts(&mut writer, &mut parts, compression);
        let receive = read_response(&mut reader, &self.url);
        tokio::pin!(send);
        tokio::pin!(receive);

        let response = tokio::select! {
            response = &mut receive => response?,
            sent = &mut send => {
                if let Err(e) = sent {
                    tracing::debug!("Stopped sending parts to {}: {}", self.url, e);
                }
                receive.await?
            }
        };
        response.into_result()
    }

    // =========================================================================
    // Administrative requests
    // =========================================================================

    /// Store `content` under `file` on the peer as a local write.
    pub async fn upload<R: AsyncRead + Unpin + Send>(
        &self,
        file: &str,
        metadata: Metadata,
        content: R,
    ) -> Result<Etag> {
        let (tx, rx) = part_channel();
        let request = Request::Upload {
            file: file.to_string(),
            metadata,
        };
        let produce = async move {
            if let Err(e) = send_bytes(content, &tx).await {
                let _ = tx.send(Err(e)).await;
            }
        };
        let (stored, ()) = tokio::join!(self.call_with_parts(&request, rx), produce);
        stored
    }

    /// Ask the peer to push `file` to `destination_url`.
    pub async fn push(&self, file: &str, destination_url: &str) -> Result<SynchronizationReport> {
        self.call(&Request::Push {
            file: file.to_string(),
            destination_url: destination_url.to_string(),
        })
        .await
    }

    /// Ask the peer to push all its unseen changes to `destination_url`.
    pub async fn synchronize_destination(
        &self,
        destination_url: &str,
    ) -> Result<Vec<SynchronizationReport>> {
        self.call(&Request::SynchronizeDestination {
            destination_url: destination_url.to_string(),
        })
        .await
    }

    pub async fn status(&self) -> Result<ServerStatus> {
        self.call(&Request::Status).await
    }
}

#[async_trait]
impl<C: Connect> SyncDestination for RemoteDestination<C> {
    fn url(&self) -> &str {
        &self.url
    }

    async fn server_id(&self) -> Result<ServerId> {
        self.call(&Request::ServerId).await
    }

    async fn get_metadata(&self, file: &str) -> Result<Option<Metadata>> {
        self.call(&Request::GetMetadata {
            file: file.to_string(),
        })
        .await
    }

    async fn signature_manifest(&self, file: &str) -> Result<Option<SignatureManifest>> {
        self.call(&Request::SignatureManifest {
            file: file.to_string(),
        })
        .await
    }

    async fn read_signature(&self, name: &str, offset: u64, length: u64) -> Result<Bytes> {
        let encoded: String = self
            .call(&Request::ReadSignature {
                name: name.to_string(),
                offset,
                length,
            })
            .await?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| SyncError::Protocol(format!("Invalid signature range: {}", e)))?;
        Ok(Bytes::from(decoded))
    }

    async fn update_content(
        &self,
        request: FileRequest,
        mode: TransferMode,
        parts: PartReceiver,
    ) -> Result<SynchronizationReport> {
        self.call_with_parts(&Request::UpdateContent { request, mode }, parts)
            .await
    }

    async fn update_metadata(&self, request: FileRequest) -> Result<SynchronizationReport> {
        self.call(&Request::UpdateMetadata { request }).await
    }

    async fn delete(&self, request: FileRequest) -> Result<SynchronizationReport> {
        self.call(&Request::Delete { request }).await
    }

    async fn rename(
        &self,
        request: FileRequest,
        new_name: &str,
    ) -> Result<SynchronizationReport> {
        self.call(&Request::Rename {
            request,
            new_name: new_name.to_string(),
        })
        .await
    }

    async fn confirm(&self, files: Vec<String>) -> Result<Vec<SynchronizationConfirmation>> {
        self.call(&Request::Confirm { files }).await
    }

    async fn last_synchronization(
        &self,
        source: ServerId,
    ) -> Result<SourceSynchronizationInformation> {
        self.call(&Request::LastSynchronization { source }).await
    }

    async fn increment_last_etag(&self, source: SourceInfo, etag: Etag) -> Result<()> {
        self.call(&Request::IncrementLastEtag { source, etag }).await
    }

    async fn apply_conflict(
        &self,
        file: &str,
        remote: HistoryItem,
        remote_history: Vec<HistoryItem>,
        remote_server_url: Option<String>,
    ) -> Result<()> {
        self.call(&Request::ApplyConflict {
            file: file.to_string(),
            remote,
            remote_history,
            remote_server_url,
        })
        .await
    }

    async fn resolve_conflict(
        &self,
        file: &str,
        strategy: ConflictResolutionStrategy,
    ) -> Result<()> {
        self.call(&Request::ResolveConflict {
            file: file.to_string(),
            strategy,
        })
        .await
    }

    async fn resolve_conflict_in_favor_of_dest(
        &self,
        file: &str,
        remote: HistoryItem,
        remote_history: Vec<HistoryItem>,
        remote_server_url: String,
    ) -> Result<()> {
        self.call(&Request::ResolveConflictInFavorOfDest {
            file: file.to_string(),
            remote,
            remote_history,
            remote_server_url,
        })
        .await
    }

    async fn finished(&self, paging: Paging) -> Result<ListPage<SynchronizationReport>> {
        self.call(&Request::Finished { paging }).await
    }

    async fn active(&self, paging: Paging) -> Result<ListPage<SynchronizationDetails>> {
        self.call(&Request::Active { paging }).await
    }

    async fn pending(&self, paging: Paging) -> Result<ListPage<SynchronizationDetails>> {
        self.call(&Request::Pending { paging }).await
    }

    async fn conflicts(&self, paging: Paging) -> Result<ListPage<ConflictItem>> {
        self.call(&Request::Conflicts { paging }).await
    }
}

/// Resolves destination URLs to [`RemoteDestination`]s sharing one
/// connector.
pub struct WireResolver<C: Connect = TcpConnector> {
    connector: Arc<C>,
    local_url: String,
    compression: bool,
}

pub type TcpResolver = WireResolver<TcpConnector>;

impl<C: Connect> WireResolver<C> {
    pub fn new(connector: Arc<C>, local_url: impl Into<String>) -> Self {
        Self {
            connector,
            local_url: local_url.into(),
            compression: true,
        }
    }

    pub fn with_compression(mut self, compression: bool) -> Self {
        self.compression = compression;
        self
    }
}

impl<C: Connect> DestinationResolver for WireResolver<C> {
    fn resolve(&self, url: &str) -> Result<Arc<dyn SyncDestination>> {
        Ok(Arc::new(
            RemoteDestination::new(url, self.connector.clone())
                .with_local_url(self.local_url.as_str())
                .with_compression(self.compression),
        ))
    }
}
