//! Best-effort HTTP uplink worker.
//!
//! A bounded queue drained by a single worker task that owns the HTTP
//! client. Enqueueing never blocks; when the queue is full or a request
//! fails, the notice is dropped. There is no delivery guarantee and no
//! ordering beyond best-effort FIFO.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error};

use canopy_mesh::config::UplinkSettings;
use canopy_mesh::uplink::UplinkNotice;

const QUEUE_DEPTH: usize = 256;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Cheap handle for queueing notices; all clones feed the same worker.
#[derive(Clone)]
pub struct UplinkSink {
    tx: Option<mpsc::Sender<UplinkNotice>>,
}

/// Spawn the worker, or a no-op sink when the uplink is disabled.
pub fn spawn(settings: Option<UplinkSettings>) -> UplinkSink {
    let Some(settings) = settings else {
        debug!("uplink disabled");
        return UplinkSink { tx: None };
    };
    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
    tokio::spawn(worker(settings, rx));
    UplinkSink { tx: Some(tx) }
}

impl UplinkSink {
    /// Queue one notice; dropped when the queue is full.
    pub fn push(&self, notice: UplinkNotice) {
        if let Some(tx) = &self.tx {
            if let Err(e) = tx.try_send(notice) {
                debug!(error = %e, "uplink notice dropped");
            }
        }
    }

    pub fn push_all(&self, notices: Vec<UplinkNotice>) {
        for notice in notices {
            self.push(notice);
        }
    }
}

async fn worker(settings: UplinkSettings, mut rx: mpsc::Receiver<UplinkNotice>) {
    let client = match reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "cannot build uplink client");
            return;
        }
    };

    while let Some(notice) = rx.recv().await {
        let url = notice_url(&settings, &notice);
        match client.get(url.as_str()).send().await {
            Ok(response) => debug!(status = %response.status(), %url, "uplink request"),
            Err(e) => debug!(error = %e, %url, "uplink request failed"),
        }
    }
}

fn notice_url(settings: &UplinkSettings, notice: &UplinkNotice) -> String {
    let base = settings.base_url.trim_end_matches('/');
    let token = &settings.token;
    match notice {
        UplinkNotice::StatusChange { node, status } => {
            format!("{base}/machine/{node}/{status}/{token}")
        }
        UplinkNotice::CommandTrace { node, text } => {
            format!("{base}/extralog/{node}/{}/{token}", encode_component(text))
        }
        UplinkNotice::AliveChanged { node, alive } => {
            format!("{base}/extralog/{node}/ALIVE-{}/{token}", u8::from(*alive))
        }
        UplinkNotice::Alive => format!("{base}/alive/{token}"),
        UplinkNotice::RawRequest { url } => url.clone(),
    }
}

/// Path-segment escaping for free-text trace fields.
fn encode_component(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for byte in text.bytes() {
        match byte {
            b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
