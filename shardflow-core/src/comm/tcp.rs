//! TCP worker group
//!
//! One listener per worker. Frames are a length-prefixed JSON header;
//! broadcast payloads follow their header as raw bytes. Outgoing
//! connections are opened lazily and retried while peers start up. The
//! barrier is gathered and released by rank 0.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use super::Channel;
use crate::error::{Result, ShardflowError};

/// Largest accepted frame
const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

/// Configuration for a TCP channel
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// This worker's rank
    pub rank: u32,
    /// Listen address of every worker, indexed by rank
    pub peers: Vec<SocketAddr>,
    /// Connection attempts per peer, 0 to wait until the peer listens
    pub connect_retries: u32,
    /// Delay between connection attempts
    pub connect_backoff: Duration,
}

impl TcpConfig {
    pub fn new(rank: u32, peers: Vec<SocketAddr>) -> Self {
        Self {
            rank,
            peers,
            connect_retries: 0,
            connect_backoff: Duration::from_millis(100),
        }
    }

    /// Bound the connection attempts per peer
    pub fn with_connect(mut self, retries: u32, backoff: Duration) -> Self {
        self.connect_retries = retries;
        self.connect_backoff = backoff;
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Frame {
    Token { from: u32, payload: u32 },
    /// Followed by `len` raw payload bytes
    Broadcast { len: usize },
    Arrive { from: u32 },
    Release,
}

fn encode(frame: &Frame, payload: &[u8]) -> Result<Bytes> {
    let header = serde_json::to_vec(frame)?;
    let mut buf = BytesMut::with_capacity(4 + header.len() + payload.len());
    buf.put_u32(header.len() as u32);
    buf.put_slice(&header);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

fn check_frame_len(len: usize) -> Result<()> {
    if len > MAX_FRAME_BYTES {
        return Err(ShardflowError::InvalidMessage {
            reason: format!("frame of {} bytes exceeds limit", len),
        });
    }
    Ok(())
}

struct Inboxes {
    tokens: mpsc::UnboundedSender<(u32, u32)>,
    broadcasts: mpsc::UnboundedSender<Bytes>,
    arrivals: mpsc::UnboundedSender<u32>,
    releases: mpsc::UnboundedSender<()>,
}

impl Inboxes {
    fn dispatch(&self, frame: Frame, payload: Bytes) -> bool {
        match frame {
            Frame::Token { from, payload } => self.tokens.send((from, payload)).is_ok(),
            Frame::Broadcast { .. } => self.broadcasts.send(payload).is_ok(),
            Frame::Arrive { from } => self.arrivals.send(from).is_ok(),
            Frame::Release => self.releases.send(()).is_ok(),
        }
    }
}

/// Channel of one worker in a TCP group
pub struct TcpChannel {
    config: TcpConfig,
    writers: Mutex<HashMap<u32, OwnedWriteHalf>>,
    tokens: Mutex<mpsc::UnboundedReceiver<(u32, u32)>>,
    broadcasts: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    arrivals: Mutex<mpsc::UnboundedReceiver<u32>>,
    releases: Mutex<mpsc::UnboundedReceiver<()>>,
}

impl TcpChannel {
    /// Bind this worker's listener and start accepting peers
    pub async fn bind(config: TcpConfig) -> Result<Self> {
        let addr = *config
            .peers
            .get(config.rank as usize)
            .ok_or_else(|| ShardflowError::InvalidConfig {
                reason: format!("rank {} has no peer address", config.rank),
            })?;

        let listener = TcpListener::bind(addr).await?;
        debug!("Worker {} listening on {}", config.rank, addr);

        let (tokens_tx, tokens) = mpsc::unbounded_channel();
        let (broadcasts_tx, broadcasts) = mpsc::unbounded_channel();
        let (arrivals_tx, arrivals) = mpsc::unbounded_channel();
        let (releases_tx, releases) = mpsc::unbounded_channel();
        let inboxes = std::sync::Arc::new(Inboxes {
            tokens: tokens_tx,
            broadcasts: broadcasts_tx,
            arrivals: arrivals_tx,
            releases: releases_tx,
        });

        let rank = config.rank;
        tokio::spawn(async move {
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Worker {} accept failed: {}", rank, e);
                        continue;
                    }
                };
                let inboxes = inboxes.clone();
                tokio::spawn(async move {
                    if let Err(e) = read_frames(stream, &inboxes).await {
                        debug!("Worker {} connection from {} ended: {}", rank, remote, e);
                    }
                });
            }
        });

        Ok(Self {
            config,
            writers: Mutex::new(HashMap::new()),
            tokens: Mutex::new(tokens),
            broadcasts: Mutex::new(broadcasts),
            arrivals: Mutex::new(arrivals),
            releases: Mutex::new(releases),
        })
    }

    async fn connect(&self, peer: u32) -> Result<OwnedWriteHalf> {
        let addr = *self
            .config
            .peers
            .get(peer as usize)
            .ok_or_else(|| ShardflowError::Channel {
                peer,
                reason: "no such worker".into(),
            })?;

        let limit = self.config.connect_retries;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    let (_, writer) = stream.into_split();
                    return Ok(writer);
                }
                Err(e) if limit != 0 && attempt >= limit => {
                    return Err(ShardflowError::Channel {
                        peer,
                        reason: format!("{} after {} attempts", e, attempt),
                    });
                }
                Err(e) => {
                    if attempt % 100 == 0 {
                        warn!(
                            "Worker {} still waiting for worker {} at {}: {}",
                            self.config.rank, peer, addr, e
                        );
                    } else {
                        debug!(
                            "Worker {} connect attempt {} to {} failed: {}",
                            self.config.rank, attempt, addr, e
                        );
                    }
                    tokio::time::sleep(self.config.connect_backoff).await;
                }
            }
        }
    }

    async fn send_frame(&self, peer: u32, frame: &Frame) -> Result<()> {
        let bytes = encode(frame, &[])?;
        self.send_encoded(peer, &bytes).await
    }

    async fn send_encoded(&self, peer: u32, bytes: &[u8]) -> Result<()> {
        let mut writers = self.writers.lock().await;

        if !writers.contains_key(&peer) {
            let writer = self.connect(peer).await?;
            writers.insert(peer, writer);
        }

        let writer = writers.get_mut(&peer).ok_or_else(|| ShardflowError::Channel {
            peer,
            reason: "writer missing".into(),
        })?;

        if let Err(e) = writer.write_all(bytes).await {
            writers.remove(&peer);
            return Err(ShardflowError::Channel {
                peer,
                reason: e.to_string(),
            });
        }
        Ok(())
    }

    fn closed(&self, what: &str) -> ShardflowError {
        ShardflowError::Channel {
            peer: self.config.rank,
            reason: format!("{} inbox closed", what),
        }
    }
}

async fn read_frames<R: AsyncRead + Unpin>(mut stream: R, inboxes: &Inboxes) -> Result<()> {
    loop {
        let len = match stream.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        check_frame_len(len)?;

        let mut header = vec![0u8; len];
        stream.read_exact(&mut header).await?;
        let frame: Frame = serde_json::from_slice(&header)?;

        let payload = match frame {
            Frame::Broadcast { len } => {
                check_frame_len(len)?;
                let mut data = vec![0u8; len];
                stream.read_exact(&mut data).await?;
                Bytes::from(data)
            }
            _ => Bytes::new(),
        };
        if !inboxes.dispatch(frame, payload) {
            return Ok(());
        }
    }
}

#[async_trait]
impl Channel for TcpChannel {
    fn rank(&self) -> u32 {
        self.config.rank
    }

    fn size(&self) -> u32 {
        self.config.peers.len() as u32
    }

    async fn send(&self, to: u32, payload: u32) -> Result<()> {
        self.send_frame(
            to,
            &Frame::Token {
                from: self.config.rank,
                payload,
            },
        )
        .await
    }

    async fn receive(&self) -> Result<(u32, u32)> {
        self.tokens
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| self.closed("token"))
    }

    async fn broadcast_bytes(&self, value: Option<Bytes>, root: u32) -> Result<Bytes> {
        if self.config.rank == root {
            let value = value.ok_or_else(|| ShardflowError::InvalidMessage {
                reason: format!("broadcast root {} has no value", root),
            })?;
            let bytes = encode(&Frame::Broadcast { len: value.len() }, &value)?;
            for peer in 0..self.size() {
                if peer != root {
                    self.send_encoded(peer, &bytes).await?;
                }
            }
            return Ok(value);
        }

        self.broadcasts
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| self.closed("broadcast"))
    }

    async fn barrier(&self) -> Result<()> {
        let size = self.size();
        if size <= 1 {
            return Ok(());
        }

        if self.config.rank == 0 {
            let mut arrivals = self.arrivals.lock().await;
            for _ in 1..size {
                arrivals.recv().await.ok_or_else(|| self.closed("barrier"))?;
            }
            drop(arrivals);

            for peer in 1..size {
                self.send_frame(peer, &Frame::Release).await?;
            }
            return Ok(());
        }

        self.send_frame(
            0,
            &Frame::Arrive {
                from: self.config.rank,
            },
        )
        .await?;
        self.releases
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| self.closed("barrier"))
    }
}
