//! The supervisor run loop.
//!
//! One task owns the byte link and is the sole driver of the engine. The
//! outer loop re-establishes the link after any loss and replays the session
//! preamble; the inner loop alternates between reading one line (bounded to
//! one second for liveness) and one scheduler tick. Engine access from other
//! tasks (debug interface, status writer) goes through the same mutex, so
//! node state is only ever mutated under it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use canopy_mesh::engine::Engine;

use crate::debug::TapMsg;
use crate::link::{Link, LinkStream};
use crate::uplink::UplinkSink;

const READ_TIMEOUT: Duration = Duration::from_secs(1);
const TICK_YIELD: Duration = Duration::from_millis(1);

pub async fn run(
    engine: Arc<Mutex<Engine>>,
    mut link: Link,
    tap: broadcast::Sender<TapMsg>,
    uplink: UplinkSink,
) -> anyhow::Result<()> {
    loop {
        let mut stream = link.connect().await?;
        engine.lock().await.reset_runtime();

        // Session preamble: reboot the gateway to kill any stale session,
        // then install the root routing table.
        if let Err(e) = preamble(&engine, &mut stream, &tap).await {
            warn!(error = %e, "session preamble failed");
            link.mark_down();
            continue;
        }
        engine.lock().await.begin_session(Instant::now());
        info!("gateway session started");

        session(&engine, &mut stream, &tap, &uplink).await;
        link.mark_down();
        info!("gateway session ended, reconnecting");
    }
}

async fn preamble(
    engine: &Arc<Mutex<Engine>>,
    stream: &mut LinkStream,
    tap: &broadcast::Sender<TapMsg>,
) -> std::io::Result<()> {
    send_line(stream, "reboot", tap).await?;
    tokio::time::sleep(Duration::from_secs(2)).await;
    let routes = engine.lock().await.master_routes_line();
    send_line(stream, &routes, tap).await?;
    tokio::time::sleep(Duration::from_secs(1)).await;
    Ok(())
}

/// Drive one gateway session until the link dies or a restart is requested.
async fn session(
    engine: &Arc<Mutex<Engine>>,
    stream: &mut LinkStream,
    tap: &broadcast::Sender<TapMsg>,
    uplink: &UplinkSink,
) {
    loop {
        match timeout(READ_TIMEOUT, stream.lines.next_line()).await {
            Ok(Ok(None)) => {
                warn!("link closed by peer");
                return;
            }
            Ok(Ok(Some(line))) => {
                let line = line.trim_end();
                debug!(%line, "RECV");
                let _ = tap.send(TapMsg {
                    text: format!("{line}\n"),
                    raw: true,
                });
                let notices = engine.lock().await.handle_line(line, Instant::now());
                uplink.push_all(notices);
            }
            Ok(Err(e)) => {
                warn!(error = %e, "link read failed");
                return;
            }
            // Read timeout: nothing arrived, fall through to the tick.
            Err(_) => {}
        }

        let out = {
            let mut eng = engine.lock().await;
            if eng.take_restart_requested() {
                info!("restart requested");
                return;
            }
            eng.tick(Instant::now())
        };
        uplink.push_all(out.notices);

        if let Some(line) = out.line {
            if let Err(e) = send_line(stream, &line, tap).await {
                warn!(error = %e, "link write failed");
                return;
            }
        }

        tokio::time::sleep(TICK_YIELD).await;
    }
}

async fn send_line(
    stream: &mut LinkStream,
    line: &str,
    tap: &broadcast::Sender<TapMsg>,
) -> std::io::Result<()> {
    debug!(%line, "SEND");
    let _ = tap.send(TapMsg {
        text: format!("  -->{line}\n"),
        raw: true,
    });
    stream.writer.write_all(line.as_bytes()).await?;
    stream.writer.write_all(b"\n").await?;
    stream.writer.flush().await
}
