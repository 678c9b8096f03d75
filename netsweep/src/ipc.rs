//! Framed IPC service over a unix-domain socket.
//!
//! Frame layout: `u32` message code, `u32` payload length, payload — all
//! integers little-endian, strings length-prefixed.  Queue depth and worker
//! usage are answered directly from shared state; cache-reload and shutdown
//! requests are forwarded to the scheduler.  A failed outbound reply is
//! logged and the peer released.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::queue::JobQueue;
use crate::scheduler::ControlMsg;
use crate::usage::UsageTracker;

/// Request: reply with the pending-checks count.
pub const IPC_QUEUE: u32 = 1;
/// Request: reply with per-worker busy fractions.
pub const IPC_USAGE_STATS: u32 = 2;
/// Response code carrying the usage-stats vector.
pub const IPC_USAGE_STATS_RESULT: u32 = 3;
/// Request: drop cached SNMP session state.
pub const IPC_SNMP_CACHE_RELOAD: u32 = 4;
/// Request: terminate the engine.
pub const IPC_SHUTDOWN: u32 = 5;

const FRAME_MAX: usize = 16 * 1024 * 1024;
const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcMessage {
    pub code: u32,
    pub data: Bytes,
}

impl IpcMessage {
    pub fn new(code: u32) -> Self {
        Self { code, data: Bytes::new() }
    }

    pub fn with_data(code: u32, data: Bytes) -> Self {
        Self { code, data }
    }
}

/// Little-endian `code + length + payload` framing.
#[derive(Debug, Default)]
pub struct IpcCodec;

impl Decoder for IpcCodec {
    type Item = IpcMessage;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<IpcMessage>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let code = u32::from_le_bytes(src[0..4].try_into().expect("4-byte slice"));
        let len = u32::from_le_bytes(src[4..8].try_into().expect("4-byte slice")) as usize;
        if len > FRAME_MAX {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("ipc frame of {len} bytes exceeds the limit"),
            ));
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        let data = src.split_to(len).freeze();
        Ok(Some(IpcMessage { code, data }))
    }
}

impl Encoder<IpcMessage> for IpcCodec {
    type Error = std::io::Error;

    fn encode(&mut self, msg: IpcMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if msg.data.len() > FRAME_MAX {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "ipc frame exceeds the limit",
            ));
        }
        dst.reserve(HEADER_LEN + msg.data.len());
        dst.put_u32_le(msg.code);
        dst.put_u32_le(msg.data.len() as u32);
        dst.put_slice(&msg.data);
        Ok(())
    }
}

/// Packs `u32 n` followed by `n` little-endian doubles.
pub fn pack_usage_stats(usage: &[f64]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + usage.len() * 8);
    buf.put_u32_le(usage.len() as u32);
    for value in usage {
        buf.put_f64_le(*value);
    }
    buf.freeze()
}

pub fn unpack_usage_stats(mut data: &[u8]) -> Option<Vec<f64>> {
    if data.len() < 4 {
        return None;
    }
    let n = data.get_u32_le() as usize;
    if data.len() != n * 8 {
        return None;
    }
    Some((0..n).map(|_| data.get_f64_le()).collect())
}

/// Packs a length-prefixed string.
pub fn pack_str(dst: &mut BytesMut, text: &str) {
    dst.put_u32_le(text.len() as u32);
    dst.put_slice(text.as_bytes());
}

pub fn unpack_str(data: &mut &[u8]) -> Option<String> {
    if data.len() < 4 {
        return None;
    }
    let len = data.get_u32_le() as usize;
    if data.len() < len {
        return None;
    }
    let (head, tail) = data.split_at(len);
    let text = String::from_utf8(head.to_vec()).ok()?;
    *data = tail;
    Some(text)
}

pub(crate) struct IpcService {
    listener: UnixListener,
    path: PathBuf,
    queue: Arc<JobQueue>,
    usage: Arc<UsageTracker>,
    ctrl: mpsc::Sender<ControlMsg>,
}

impl IpcService {
    /// Binds the endpoint, replacing a stale socket file.  Bind failures are
    /// fatal at engine init.
    pub fn bind(
        path: &Path,
        queue: Arc<JobQueue>,
        usage: Arc<UsageTracker>,
        ctrl: mpsc::Sender<ControlMsg>,
    ) -> Result<Self, EngineError> {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)
            .map_err(|err| EngineError::Startup(format!("cannot bind ipc socket {path:?}: {err}")))?;
        Ok(Self { listener, path: path.to_path_buf(), queue, usage, ctrl })
    }

    pub async fn serve(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    let queue = self.queue.clone();
                    let usage = self.usage.clone();
                    let ctrl = self.ctrl.clone();
                    tokio::spawn(serve_client(stream, queue, usage, ctrl));
                }
                Err(err) => {
                    warn!("ipc accept failed: {err}");
                    break;
                }
            }
        }
    }
}

impl Drop for IpcService {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn serve_client(
    stream: UnixStream,
    queue: Arc<JobQueue>,
    usage: Arc<UsageTracker>,
    ctrl: mpsc::Sender<ControlMsg>,
) {
    let mut framed = Framed::new(stream, IpcCodec);
    while let Some(request) = framed.next().await {
        let request = match request {
            Ok(request) => request,
            Err(err) => {
                warn!("ipc request failed: {err}");
                return;
            }
        };
        let reply = match request.code {
            IPC_QUEUE => {
                let pending = queue.pending_checks();
                Some(IpcMessage::with_data(
                    IPC_QUEUE,
                    Bytes::copy_from_slice(&pending.to_le_bytes()),
                ))
            }
            IPC_USAGE_STATS => Some(IpcMessage::with_data(
                IPC_USAGE_STATS_RESULT,
                pack_usage_stats(&usage.snapshot()),
            )),
            IPC_SNMP_CACHE_RELOAD => {
                let _ = ctrl.send(ControlMsg::SnmpCacheReload).await;
                None
            }
            IPC_SHUTDOWN => {
                debug!("shutdown message received");
                let _ = ctrl.send(ControlMsg::Shutdown).await;
                None
            }
            other => {
                warn!(code = other, "unknown ipc request ignored");
                None
            }
        };
        if let Some(reply) = reply {
            if let Err(err) = framed.send(reply).await {
                warn!("ipc reply failed: {err}");
                return;
            }
        }
    }
}

/// Minimal request/response client for the engine's IPC endpoint.
pub struct IpcClient {
    framed: Framed<UnixStream, IpcCodec>,
}

impl IpcClient {
    pub async fn connect(path: &Path) -> Result<Self, EngineError> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self { framed: Framed::new(stream, IpcCodec) })
    }

    pub async fn send(&mut self, msg: IpcMessage) -> Result<(), EngineError> {
        self.framed.send(msg).await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<Option<IpcMessage>, EngineError> {
        match self.framed.next().await {
            Some(msg) => Ok(Some(msg?)),
            None => Ok(None),
        }
    }

    /// Queue depth as served by [`IPC_QUEUE`].
    pub async fn queue_depth(&mut self) -> Result<u64, EngineError> {
        self.send(IpcMessage::new(IPC_QUEUE)).await?;
        let reply = self.recv().await?.ok_or_else(|| {
            EngineError::Ipc(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before reply",
            ))
        })?;
        let bytes: [u8; 8] = reply.data.as_ref().try_into().map_err(|_| {
            EngineError::Ipc(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "malformed queue reply",
            ))
        })?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Per-worker busy fractions as served by [`IPC_USAGE_STATS`].
    pub async fn usage_stats(&mut self) -> Result<Vec<f64>, EngineError> {
        self.send(IpcMessage::new(IPC_USAGE_STATS)).await?;
        let reply = self.recv().await?.ok_or_else(|| {
            EngineError::Ipc(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before reply",
            ))
        })?;
        unpack_usage_stats(&reply.data).ok_or_else(|| {
            EngineError::Ipc(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "malformed usage-stats reply",
            ))
        })
    }
}
