//! Line transport backends.
//!
//! Two ways to reach the gateway board: a local serial device, or a TCP
//! server that accepts exactly one connection at a time from a remote
//! gateway streamer. Both hand out a buffered line stream; on (re)connect the
//! board-reset sequence (`reset`, short delay, `forward`) is written first to
//! drop any stale session on the board.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

use canopy_mesh::config::{ConnectionKind, LinkSettings};

pub type Reader = Lines<BufReader<Box<dyn AsyncRead + Send + Unpin>>>;
pub type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// A live byte link to the gateway. Reads are line-oriented
/// (`Lines::next_line` survives being raced against a timeout without
/// losing data).
pub struct LinkStream {
    pub lines: Reader,
    pub writer: Writer,
}

/// The byte link could not be re-established within the retry schedule.
#[derive(Debug, thiserror::Error)]
#[error("link lost: the byte link could not be re-established within the retry schedule")]
pub struct LinkLost;

enum Backend {
    Serial {
        device: String,
        baudrate: u32,
    },
    Tcp {
        incoming: mpsc::Receiver<tokio::net::TcpStream>,
        session_active: Arc<AtomicBool>,
    },
}

pub struct Link {
    backend: Backend,
    /// 0 = retry forever.
    max_attempts: u32,
}

impl Link {
    /// Prepare the configured backend. For TCP this binds the listener once
    /// and spawns the acceptor; extra connections are refused while a
    /// session is active.
    pub async fn new(settings: LinkSettings) -> anyhow::Result<Self> {
        let backend = match settings.connection {
            ConnectionKind::Serial => Backend::Serial {
                device: settings.serial.device,
                baudrate: settings.serial.baudrate,
            },
            ConnectionKind::Tcp => {
                let port = settings.tcp.port;
                let listener = TcpListener::bind(("0.0.0.0", port))
                    .await
                    .with_context(|| format!("binding gateway listener on port {port}"))?;
                info!(port, "waiting for gateway connections");

                let (tx, rx) = mpsc::channel(1);
                let session_active = Arc::new(AtomicBool::new(false));
                let active = session_active.clone();
                tokio::spawn(async move {
                    loop {
                        match listener.accept().await {
                            Ok((stream, peer)) => {
                                if active.load(Ordering::SeqCst) {
                                    warn!(%peer, "refusing connection, a gateway session is active");
                                    drop(stream);
                                    continue;
                                }
                                if tx.send(stream).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => warn!(error = %e, "gateway accept failed"),
                        }
                    }
                });
                Backend::Tcp {
                    incoming: rx,
                    session_active,
                }
            }
        };
        Ok(Link {
            backend,
            max_attempts: settings.max_reconnect_attempts,
        })
    }

    /// Establish (or re-establish) the link, retrying with exponential
    /// backoff up to the configured attempt limit.
    pub async fn connect(&mut self) -> Result<LinkStream, LinkLost> {
        let mut backoff = Duration::from_secs(1);
        let max_backoff = Duration::from_secs(30);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self.try_connect().await {
                Ok(mut stream) => match board_reset(&mut stream.writer).await {
                    Ok(()) => return Ok(stream),
                    Err(e) => {
                        warn!(error = %e, "board reset sequence failed");
                        self.mark_down();
                    }
                },
                Err(e) => warn!(error = %e, "link connect failed"),
            }

            if self.max_attempts != 0 && attempts >= self.max_attempts {
                return Err(LinkLost);
            }
            info!(backoff_s = backoff.as_secs(), "retrying link");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(max_backoff);
        }
    }

    async fn try_connect(&mut self) -> anyhow::Result<LinkStream> {
        match &mut self.backend {
            Backend::Serial { device, baudrate } => {
                let builder = tokio_serial::new(device.clone(), *baudrate);
                let stream = tokio_serial::SerialStream::open(&builder)
                    .with_context(|| format!("opening serial device {device}"))?;
                info!(device = %device, baudrate = *baudrate, "serial link open");
                let (rd, wr) = tokio::io::split(stream);
                let boxed: Box<dyn AsyncRead + Send + Unpin> = Box::new(rd);
                Ok(LinkStream {
                    lines: BufReader::new(boxed).lines(),
                    writer: Box::new(wr),
                })
            }
            Backend::Tcp {
                incoming,
                session_active,
            } => {
                session_active.store(false, Ordering::SeqCst);
                let stream = incoming
                    .recv()
                    .await
                    .context("gateway acceptor stopped")?;
                session_active.store(true, Ordering::SeqCst);
                let peer = stream.peer_addr().ok();
                info!(?peer, "gateway connected");
                let (rd, wr) = stream.into_split();
                let boxed: Box<dyn AsyncRead + Send + Unpin> = Box::new(rd);
                Ok(LinkStream {
                    lines: BufReader::new(boxed).lines(),
                    writer: Box::new(wr),
                })
            }
        }
    }

    /// Note the session as gone so new gateway connections are accepted
    /// again.
    pub fn mark_down(&mut self) {
        if let Backend::Tcp { session_active, .. } = &self.backend {
            session_active.store(false, Ordering::SeqCst);
        }
    }
}

/// Drop any stale session on the gateway board.
async fn board_reset(writer: &mut Writer) -> std::io::Result<()> {
    writer.write_all(b"reset\n").await?;
    writer.flush().await?;
    tokio::time::sleep(Duration::from_secs(1)).await;
    writer.write_all(b"forward\n").await?;
    writer.flush().await
}
