//! Operator debug interface.
//!
//! A TCP listener for line-oriented operator commands. Every connected
//! socket gets a mirror of the raw link traffic (unless muted) and may
//! inject commands through the scheduler's injection gate, toggle raw mode,
//! or request a supervisor restart. Rejected injections are reported to the
//! requesting socket only and never mutate node state.

use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use canopy_mesh::engine::Engine;

/// One line mirrored to connected operator sockets.
#[derive(Debug, Clone)]
pub struct TapMsg {
    pub text: String,
    /// Raw link traffic; suppressed on muted sockets.
    pub raw: bool,
}

const HELP: &str = "Hello friend!

Welcome to the mesh supervisor debug interface.
Supported commands are:

help
raw
unraw
mute
unmute
led <node> <colours...>
frames <node> <args...>
status <node> <args...>
ping <node>
check <node>
dumpstate
restart

Prefix a line with '\\' in raw mode to forward it verbatim.
##
";

pub async fn run(
    engine: Arc<Mutex<Engine>>,
    tap: broadcast::Sender<TapMsg>,
    addr: &str,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "debug interface listening");
    loop {
        let (socket, peer) = listener.accept().await?;
        info!(%peer, "debug client connected");
        let engine = engine.clone();
        let tap_rx = tap.subscribe();
        let tap_tx = tap.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(socket, engine, tap_rx, tap_tx).await {
                debug!(error = %e, "debug client i/o ended");
            }
            info!(%peer, "debug client disconnected");
        });
    }
}

async fn handle_client(
    socket: TcpStream,
    engine: Arc<Mutex<Engine>>,
    mut tap_rx: broadcast::Receiver<TapMsg>,
    tap_tx: broadcast::Sender<TapMsg>,
) -> std::io::Result<()> {
    let (rd, mut wr) = socket.into_split();
    let mut lines = BufReader::new(rd).lines();
    let mut muted = false;

    wr.write_all(HELP.as_bytes()).await?;
    let state = engine.lock().await.debug_state(Instant::now());
    wr.write_all(state.as_bytes()).await?;

    loop {
        tokio::select! {
            msg = tap_rx.recv() => match msg {
                Ok(msg) => {
                    if !(msg.raw && muted) {
                        wr.write_all(msg.text.as_bytes()).await?;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "debug tap lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
            line = lines.next_line() => {
                let Some(line) = line? else { return Ok(()) };
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                handle_command(trimmed, &engine, &mut wr, &mut muted, &tap_tx).await?;
            }
        }
    }
}

async fn handle_command(
    line: &str,
    engine: &Arc<Mutex<Engine>>,
    wr: &mut OwnedWriteHalf,
    muted: &mut bool,
    tap: &broadcast::Sender<TapMsg>,
) -> std::io::Result<()> {
    if let Some(raw) = line.strip_prefix('\\') {
        let mut eng = engine.lock().await;
        if eng.is_raw_mode() {
            eng.inject_raw(raw.to_string());
        } else {
            wr.write_all(b"Need to be in raw mode in order to send raw data\n")
                .await?;
        }
        return Ok(());
    }

    let mut parts = line.split_whitespace();
    let Some(cmd) = parts.next() else {
        return Ok(());
    };

    match cmd {
        "help" => wr.write_all(HELP.as_bytes()).await?,
        "raw" => {
            engine.lock().await.set_raw_mode(true);
            let _ = tap.send(TapMsg {
                text: "!!! RAW MODE ENABLED !!!\nSend raw data with the '\\' prefix.\n".into(),
                raw: false,
            });
        }
        "unraw" => {
            engine.lock().await.set_raw_mode(false);
            let _ = tap.send(TapMsg {
                text: "!!! RAW MODE DISABLED !!!\nRestart the supervisor unless you are sure \
                       the state still matches.\n"
                    .into(),
                raw: false,
            });
        }
        "mute" => {
            *muted = true;
            wr.write_all(b"Muted raw output\n").await?;
        }
        "unmute" => {
            *muted = false;
            wr.write_all(b"Un-muted raw output\n").await?;
        }
        "led" => inject(engine, wr, parts, "led").await?,
        "frames" => inject(engine, wr, parts, "raw_frames").await?,
        "status" => inject(engine, wr, parts, "raw_status").await?,
        "ping" => {
            let Some(node) = parts.next() else {
                wr.write_all(b"USAGE: ping <node>\n").await?;
                return Ok(());
            };
            let mut eng = engine.lock().await;
            match eng.resolve_id(node) {
                // Direct injection: bypasses the availability gate.
                Some(id) => eng.inject_raw(format!("ping {id}")),
                None => wr.write_all(b"### could not find node!\n").await?,
            }
        }
        "check" => {
            let Some(node) = parts.next() else {
                wr.write_all(b"USAGE: check <node>\n").await?;
                return Ok(());
            };
            match engine.lock().await.force_check(node) {
                Ok(()) => wr.write_all(b"Requested node check\n").await?,
                Err(e) => wr.write_all(format!("### {e}\n").as_bytes()).await?,
            }
        }
        "dumpstate" => {
            let state = engine.lock().await.debug_state(Instant::now());
            wr.write_all(state.as_bytes()).await?;
        }
        "restart" => {
            let _ = tap.send(TapMsg {
                text: "SUPERVISOR RESTART\n".into(),
                raw: false,
            });
            engine.lock().await.request_restart();
        }
        _ => wr.write_all(b"Unknown command\n").await?,
    }
    Ok(())
}

async fn inject(
    engine: &Arc<Mutex<Engine>>,
    wr: &mut OwnedWriteHalf,
    mut parts: std::str::SplitWhitespace<'_>,
    verb: &str,
) -> std::io::Result<()> {
    let Some(node) = parts.next() else {
        wr.write_all(b"### missing node argument\n").await?;
        return Ok(());
    };
    let args = parts.collect::<Vec<_>>().join(" ");
    match engine.lock().await.inject_for_node(node, verb, &args) {
        Ok(()) => wr.write_all(b"Command queued\n").await?,
        Err(e) => wr.write_all(format!("### {e}\n").as_bytes()).await?,
    }
    Ok(())
}
