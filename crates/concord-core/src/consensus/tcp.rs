//! TCP transport.
//!
//! Each frame is a 4-byte big-endian length followed by a JSON body.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::domain::NodeId;

use super::{RaftRequest, RaftResponse, RpcEndpoint, Transport, TransportError};

const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), TransportError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(payload.len()));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// `Ok(None)` on clean EOF before a frame starts.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>, TransportError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Outbound side over TCP.
///
/// An idle connection is checked out of the cache for the duration of one
/// exchange and returned only after a complete reply, so a cancelled or
/// failed exchange never leaves a half-read stream behind.
#[derive(Default)]
pub struct TcpTransport {
    idle: Mutex<HashMap<String, TcpStream>>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    async fn checkout(&self, addr: &str) -> Result<TcpStream, TransportError> {
        if let Some(stream) = self.idle.lock().await.remove(addr) {
            return Ok(stream);
        }
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(
        &self,
        target: &NodeId,
        addr: &str,
        request: RaftRequest,
    ) -> Result<RaftResponse, TransportError> {
        let payload = serde_json::to_vec(&request)?;
        let mut stream = self.checkout(addr).await?;
        write_frame(&mut stream, &payload).await?;
        let frame = read_frame(&mut stream)
            .await?
            .ok_or_else(|| TransportError::Unreachable(target.clone()))?;
        let response = serde_json::from_slice(&frame)?;
        self.idle.lock().await.insert(addr.to_string(), stream);
        Ok(response)
    }
}

/// Accept peer connections on `listener` and feed requests to `endpoint`
/// until `shutdown` flips to `true`.
pub async fn serve_tcp(
    listener: TcpListener,
    endpoint: RpcEndpoint,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "raft rpc listening");
    }
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let endpoint = endpoint.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve_connection(stream, endpoint).await {
                            debug!(%peer, error = %err, "raft rpc connection closed");
                        }
                    });
                }
                Err(err) => warn!(error = %err, "raft rpc accept failed"),
            },
        }
    }
}

async fn serve_connection(mut stream: TcpStream, endpoint: RpcEndpoint) -> Result<(), TransportError> {
    stream.set_nodelay(true)?;
    while let Some(frame) = read_frame(&mut stream).await? {
        let request: RaftRequest = serde_json::from_slice(&frame)?;
        let response = endpoint.handle(request).await?;
        write_frame(&mut stream, &serde_json::to_vec(&response)?).await?;
    }
    Ok(())
}
