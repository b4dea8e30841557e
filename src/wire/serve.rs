//! Server side of the protocol: accept loop and per-connection dispatch.

use anyhow::Result;
use base64::Engine;
use bytes::Bytes;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpListener;

use super::message::{Request, Response, ServerStatus};
use super::protocol::{
    decode_json, decode_part, encode_json, negotiate_version, read_frame, write_frame, Abort,
    Fatal, Hello, HelloFlags, MessageType, VersionNegotiationResult,
};
use crate::error::{FailureKind, SyncError};
use crate::metadata::Metadata;
use crate::rdc::{part_channel, PartReceiver, PartSender, TransferPart};
use crate::report::Paging;
use crate::server::SyncServer;
use crate::tag::Etag;

/// Bind `address` and serve connections until the listener fails.
pub async fn listen(server: Arc<SyncServer>, address: &str) -> Result<()> {
    let listener = TcpListener::bind(address).await?;
    tracing::info!("Server {} listening on {}", server.id(), listener.local_addr()?);
    serve(server, listener).await
}

pub async fn serve(server: Arc<SyncServer>, listener: TcpListener) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(server, stream).await {
                tracing::warn!("Connection from {} failed: {:#}", peer, e);
            }
        });
    }
}

async fn send_fatal<W: AsyncWrite + Unpin>(writer: &mut W, code: u16, message: String) -> Result<()> {
    tracing::warn!("Closing connection: {}", message);
    write_frame(writer, &Fatal { code, message }.encode()).await?;
    writer.flush().await?;
    Ok(())
}

/// Serve one connection: HELLO exchange, then a single request.
pub async fn handle_connection<S>(server: Arc<SyncServer>, stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let (msg_type, payload) = read_frame(&mut reader).await?;
    if msg_type != MessageType::Hello {
        let message = format!("Expected HELLO, got {:?}", msg_type);
        return send_fatal(&mut writer, Fatal::UNEXPECTED_MESSAGE, message).await;
    }
    let hello = Hello::decode(payload)?;
    match negotiate_version(hello.version) {
        VersionNegotiationResult::Supported(_) => {}
        VersionNegotiationResult::TooOld {
            client,
            min_supported,
        } => {
            let message = format!(
                "Protocol version {} is too old, minimum is {}",
                client, min_supported
            );
            return send_fatal(&mut writer, Fatal::UNSUPPORTED_VERSION, message).await;
        }
        VersionNegotiationResult::TooNew {
            client,
            max_supported,
        } => {
            let message = format!(
                "Protocol version {} is too new, maximum is {}",
                client, max_supported
            );
            return send_fatal(&mut writer, Fatal::UNSUPPORTED_VERSION, message).await;
        }
    }

    let compression = hello.compression();
    let flags = if compression {
        HelloFlags::COMPRESSION
    } else {
        HelloFlags::empty()
    };
    write_frame(&mut writer, &Hello::new(flags, server.url()).encode()).await?;
    writer.flush().await?;

    let (msg_type, payload) = read_frame(&mut reader).await?;
    if msg_type != MessageType::Request {
        let message = format!("Expected REQUEST, got {:?}", msg_type);
        return send_fatal(&mut writer, Fatal::UNEXPECTED_MESSAGE, message).await;
    }
    let request: Request = match decode_json(payload) {
        Ok(request) => request,
        Err(e) => {
            let message = format!("Malformed request: {:#}", e);
            return send_fatal(&mut writer, Fatal::BAD_REQUEST, message).await;
        }
    };
    tracing::debug!("Request from {}: {:?}", hello.server_url, request);

    if request.has_parts() {
        return dispatch_with_parts(&server, request, &mut reader, &mut writer).await;
    }

    let response = dispatch(&server, request).await;
    write_frame(&mut writer, &encode_json(MessageType::Response, &response)?).await?;
    writer.flush().await?;
    Ok(())
}

async fn dispatch(server: &SyncServer, request: Request) -> Response {
    match request {
        Request::ServerId => Response::from_result(Ok(server.id())),
        Request::GetMetadata { file } => Response::from_result(server.file_metadata(&file)),
        Request::SignatureManifest { file } => {
            Response::from_result(server.signature_manifest(&file).await)
        }
        Request::ReadSignature {
            name,
            offset,
            length,
        } => Response::from_result(
            server
                .read_signature(&name, offset, length)
                .map(|range| base64::engine::general_purpose::STANDARD.encode(&range)),
        ),
        Request::UpdateMetadata { request } => {
            Response::from_result(Ok(server.receive_metadata(request).await))
        }
        Request::Delete { request } => Response::from_result(Ok(server.receive_delete(request).await)),
        Request::Rename { request, new_name } => {
            Response::from_result(Ok(server.receive_rename(request, &new_name).await))
        }
        Request::Confirm { files } => Response::from_result(server.confirm(&files)),
        Request::LastSynchronization { source } => {
            Response::from_result(server.last_synchronization(&source))
        }
        Request::IncrementLastEtag { source, etag } => {
            Response::from_result(server.increment_last_etag(&source, etag))
        }
        Request::ApplyConflict {
            file,
            remote,
            remote_history,
            remote_server_url,
        } => Response::from_result(server.apply_conflict(
            &file,
            remote,
            remote_history,
            remote_server_url,
        )),
        Request::ResolveConflict { file, strategy } => {
            Response::from_result(server.resolve_conflict(&file, strategy).await)
        }
        Request::ResolveConflictInFavorOfDest {
            file,
            remote,
            remote_history,
            remote_server_url,
        } => Response::from_result(server.resolve_conflict_in_favor_of_dest(
            &file,
            remote,
            remote_history,
            remote_server_url,
        )),
        Request::Finished { paging } => Response::from_result(server.finished(paging)),
        Request::Active { paging } => Response::from_result(Ok(server.queue().active(paging))),
        Request::Pending { paging } => Response::from_result(Ok(server.queue().pending(paging))),
        Request::Conflicts { paging } => Response::from_result(server.conflicts(paging)),
        Request::Push {
            file,
            destination_url,
        } => Response::from_result(server.push(&file, &destination_url).await),
        Request::SynchronizeDestination { destination_url } => {
            Response::from_result(server.synchronize_destination(&destination_url).await)
        }
        Request::Status => Response::from_result(status(server)),
        Request::UpdateContent { .. } | Request::Upload { .. } => Response::from_result::<()>(
            Err(SyncError::Protocol("Request expects transfer parts".into())),
        ),
    }
}

fn status(server: &SyncServer) -> crate::error::Result<ServerStatus> {
    Ok(ServerStatus {
        server_id: server.id(),
        url: server.url().to_string(),
        files: server.list_files()?,
        active: server.queue().active(Paging::default()),
        pending: server.queue().pending(Paging::default()),
        finished: server.finished(Paging::default())?,
        conflicts: server.conflicts(Paging::default())?,
    })
}

/// Handle a request followed by transfer parts. The response may go out
/// before the parts end; the rest of the stream is drained afterwards.
async fn dispatch_with_parts<R, W>(
    server: &SyncServer,
    request: Request,
    reader: &mut R,
    writer: &mut W,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let (tx, rx) = part_channel();
    let forward = forward_parts(reader, tx);
    let handle = async {
        match request {
            Request::UpdateContent { request, mode } => {
                Response::from_result(Ok(server.receive_content(request, mode, rx).await))
            }
            Request::Upload { file, metadata } => {
                Response::from_result(upload_parts(server, &file, metadata, rx).await)
            }
            other => dispatch(server, other).await,
        }
    };
    tokio::pin!(forward);
    tokio::pin!(handle);

    let (response, forwarded) = tokio::select! {
        response = &mut handle => (response, false),
        () = &mut forward => (handle.await, true),
    };

    write_frame(writer, &encode_json(MessageType::Response, &response)?).await?;
    writer.flush().await?;
    if !forwarded {
        forward.await;
    }
    Ok(())
}

/// Read part frames into `parts` until PARTS_END, ABORT or a broken stream.
/// Frames keep being read after the consumer hangs up so the peer is never
/// left blocked on a write.
async fn forward_parts<R: AsyncRead + Unpin>(reader: &mut R, parts: PartSender) {
    let mut listening = true;
    loop {
        let item = match read_frame(reader).await {
            Ok((MessageType::PartsEnd, _)) => return,
            Ok((MessageType::Abort, payload)) => {
                let message = Abort::decode(payload)
                    .map(|abort| abort.message)
                    .unwrap_or_else(|e| format!("{:#}", e));
                Err(SyncError::from_remote(FailureKind::TransferFault, message))
            }
            Ok((msg_type, payload)) => match decode_part(msg_type, payload) {
                Ok(Some(part)) => Ok(part),
                Ok(None) => Err(SyncError::Protocol(format!(
                    "Unexpected {:?} frame in a transfer",
                    msg_type
                ))),
                Err(e) => Err(SyncError::Protocol(format!("{:#}", e))),
            },
            Err(e) => Err(SyncError::Transfer(format!(
                "Connection lost during transfer: {:#}",
                e
            ))),
        };

        let last = item.is_err();
        if listening && parts.send(item).await.is_err() {
            listening = false;
        }
        if last {
            return;
        }
    }
}

async fn upload_parts(
    server: &SyncServer,
    file: &str,
    metadata: Metadata,
    parts: PartReceiver,
) -> crate::error::Result<Etag> {
    let mut reader = PartReader {
        parts,
        current: Bytes::new(),
    };
    server.upload(file, metadata, &mut reader).await
}

/// [`AsyncRead`] over the `Data` parts of a byte transfer.
struct PartReader {
    parts: PartReceiver,
    current: Bytes,
}

impl AsyncRead for PartReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.current.is_empty() {
                let n = this.current.len().min(buf.remaining());
                buf.put_slice(&this.current.split_to(n));
                return Poll::Ready(Ok(()));
            }
            match ready!(this.parts.poll_recv(cx)) {
                None => return Poll::Ready(Ok(())),
                Some(Ok(TransferPart::Data(data))) => this.current = data,
                Some(Ok(_)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "Uploads carry data parts only",
                    )))
                }
                Some(Err(e)) => return Poll::Ready(Err(io::Error::other(e.to_string()))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdc::apply::PART_CHANNEL_SIZE;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_part_reader_joins_data() {
        let (tx, rx) = part_channel();
        tx.send(Ok(TransferPart::Data(Bytes::from_static(b"hello "))))
            .await
            .unwrap();
        tx.send(Ok(TransferPart::Data(Bytes::from_static(b"world"))))
            .await
            .unwrap();
        drop(tx);

        let mut reader = PartReader {
            parts: rx,
            current: Bytes::new(),
        };
        let mut content = Vec::new();
        reader.read_to_end(&mut content).await.unwrap();
        assert_eq!(content, b"hello world");
    }

    #[tokio::test]
    async fn test_part_reader_surfaces_failure() {
        let (tx, rx) = part_channel();
        tx.send(Ok(TransferPart::Data(Bytes::from_static(b"partial"))))
            .await
            .unwrap();
        tx.send(Err(SyncError::Transfer("gone".into()))).await.unwrap();
        drop(tx);

        let mut reader = PartReader {
            parts: rx,
            current: Bytes::new(),
        };
        let mut content = Vec::new();
        assert!(reader.read_to_end(&mut content).await.is_err());
    }

    #[tokio::test]
    async fn test_forward_parts_drains_after_consumer_leaves() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        for _ in 0..PART_CHANNEL_SIZE * 2 {
            let frame = super::super::protocol::encode_part(
                &TransferPart::Data(Bytes::from_static(b"x")),
                false,
            )
            .unwrap();
            write_frame(&mut client, &frame).await.unwrap();
        }
        write_frame(&mut client, &super::super::protocol::encode_parts_end())
            .await
            .unwrap();

        let (tx, rx) = part_channel();
        drop(rx);
        // Returns on PARTS_END even though nobody reads the parts
        forward_parts(&mut server, tx).await;
    }
}
