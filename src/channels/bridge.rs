//! Bridge backend — wraps `whatsapp-web.js` (browser automation) behind a
//! bundled Node.js sidecar.
//!
//! WhatsApp Web's browser-automation client lives in the Node ecosystem.
//! Rather than reimplementing browser automation, this backend spawns a
//! small bridge process that:
//!
//! 1. Connects to WhatsApp via `whatsapp-web.js` (Puppeteer underneath)
//! 2. Emits pairing QR codes and inbound messages as JSON lines on stdout
//! 3. Accepts sends on a loopback HTTP endpoint
//!
//! The bridge script is bundled at `{data_dir}/bridge/bridge.js` and is
//! auto-installed on first use. Auth state is persisted by the library
//! under `{data_dir}/bridge-auth/`; this module only chooses the path and
//! deletes it on reset.

use super::traits::{
    digits_of, is_number_allowed, split_message, InboundMessage, WhatsAppBackend, MAX_TEXT_LEN,
};
use crate::qr::{self, QrState};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

/// Respawn backoff cap, seconds.
const MAX_BACKOFF_SECS: u64 = 60;

pub struct BridgeBackend {
    auth_dir: PathBuf,
    bridge_dir: PathBuf,
    allowed_numbers: Vec<String>,
    qr: QrState,
    connected: Arc<AtomicBool>,
    /// Loopback port the bridge's send endpoint listens on.
    port: Arc<Mutex<Option<u16>>>,
    /// Signals the supervisor loop to kill + respawn the bridge process.
    restart: Arc<Notify>,
    http: reqwest::Client,
}

impl BridgeBackend {
    pub fn new(
        auth_dir: PathBuf,
        bridge_dir: PathBuf,
        allowed_numbers: Vec<String>,
        qr: QrState,
    ) -> Self {
        Self {
            auth_dir,
            bridge_dir,
            allowed_numbers,
            qr,
            connected: Arc::new(AtomicBool::new(false)),
            port: Arc::new(Mutex::new(None)),
            restart: Arc::new(Notify::new()),
            http: reqwest::Client::new(),
        }
    }

    fn bridge_script(&self) -> PathBuf {
        self.bridge_dir.join("bridge.js")
    }

    fn is_bridge_installed(&self) -> bool {
        self.bridge_script().exists() && self.bridge_dir.join("node_modules").exists()
    }

    /// Install the bridge: write `package.json` + `bridge.js`, run npm.
    fn install_bridge(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.bridge_dir).with_context(|| {
            format!("failed to create bridge dir {}", self.bridge_dir.display())
        })?;

        let package_json = json!({
            "name": "wagate-bridge",
            "version": "1.0.0",
            "private": true,
            "dependencies": {
                "whatsapp-web.js": "^1"
            }
        });
        std::fs::write(
            self.bridge_dir.join("package.json"),
            serde_json::to_string_pretty(&package_json)?,
        )?;
        std::fs::write(self.bridge_script(), WHATSAPP_BRIDGE_JS)?;

        let output = std::process::Command::new("npm")
            .args(["install", "--omit=dev"])
            .current_dir(&self.bridge_dir)
            .output()
            .map_err(|e| {
                anyhow!("npm install failed: {e}. Make sure Node.js >= 18 is installed.")
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("npm install failed: {stderr}");
        }

        info!("whatsapp bridge installed at {}", self.bridge_dir.display());
        Ok(())
    }
}

#[async_trait]
impl WhatsAppBackend for BridgeBackend {
    fn name(&self) -> &'static str {
        "bridge"
    }

    async fn start(&self) -> anyhow::Result<mpsc::Receiver<InboundMessage>> {
        let node_check = tokio::process::Command::new("node")
            .arg("--version")
            .output()
            .await;
        if node_check.is_err() {
            anyhow::bail!(
                "Node.js not found. The bridge backend requires Node.js >= 18; \
                 install it or switch to the socket backend."
            );
        }

        if !self.is_bridge_installed() {
            info!("whatsapp bridge not found — installing...");
            self.install_bridge()?;
        }

        let (tx, rx) = mpsc::channel(64);
        let ctx = BridgeLoopCtx {
            auth_dir: self.auth_dir.clone(),
            bridge_script: self.bridge_script(),
            allowed_numbers: self.allowed_numbers.clone(),
            qr: self.qr.clone(),
            connected: self.connected.clone(),
            port: self.port.clone(),
            restart: self.restart.clone(),
            tx,
        };
        tokio::spawn(bridge_loop(ctx));
        Ok(rx)
    }

    async fn send_text(&self, to_number: &str, text: &str) -> anyhow::Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            anyhow::bail!("whatsapp client not connected");
        }
        let port = { *self.port.lock() }.ok_or_else(|| anyhow!("bridge send port not known yet"))?;

        let digits = digits_of(to_number);
        if digits.is_empty() {
            anyhow::bail!("recipient `{to_number}` does not contain a phone number");
        }

        let url = format!("http://127.0.0.1:{port}/send");
        for chunk in split_message(text, MAX_TEXT_LEN) {
            let body = json!({ "type": "send", "to": digits, "text": chunk });
            let resp = self
                .http
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| anyhow!("bridge send request failed: {e}"))?;
            if !resp.status().is_success() {
                let status = resp.status();
                let detail = resp.text().await.unwrap_or_default();
                anyhow::bail!("bridge send failed: {status} {detail}");
            }
        }
        Ok(())
    }

    async fn reset_session(&self) -> anyhow::Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.qr.clear();
        if self.auth_dir.exists() {
            std::fs::remove_dir_all(&self.auth_dir).with_context(|| {
                format!("failed to delete auth state at {}", self.auth_dir.display())
            })?;
            info!("whatsapp auth state cleared — re-link with QR required");
        }
        // The supervisor kills the child and respawns it against the now
        // empty auth dir, which makes the library emit fresh QR codes.
        self.restart.notify_one();
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_linked(&self) -> bool {
        std::fs::read_dir(&self.auth_dir)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)
    }
}

struct BridgeLoopCtx {
    auth_dir: PathBuf,
    bridge_script: PathBuf,
    allowed_numbers: Vec<String>,
    qr: QrState,
    connected: Arc<AtomicBool>,
    port: Arc<Mutex<Option<u16>>>,
    restart: Arc<Notify>,
    tx: mpsc::Sender<InboundMessage>,
}

fn next_backoff(backoff: u64) -> u64 {
    (backoff * 2).min(MAX_BACKOFF_SECS)
}

/// Supervisor loop: spawn the Node.js bridge and read its JSON output,
/// respawning with doubling backoff when it exits.
async fn bridge_loop(ctx: BridgeLoopCtx) {
    let mut backoff = 1u64;

    loop {
        info!("starting whatsapp bridge process...");

        let child = tokio::process::Command::new("node")
            .arg(&ctx.bridge_script)
            .env("AUTH_DIR", ctx.auth_dir.to_string_lossy().to_string())
            .env("BRIDGE_PORT", "0")
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn();

        let mut child = match child {
            Ok(c) => c,
            Err(e) => {
                error!("failed to spawn whatsapp bridge: {e}");
                tokio::time::sleep(std::time::Duration::from_secs(backoff)).await;
                backoff = next_backoff(backoff);
                continue;
            }
        };
        backoff = 1;

        let Some(stdout) = child.stdout.take() else {
            error!("bridge spawned without stdout; killing");
            let _ = child.kill().await;
            continue;
        };
        let mut lines = BufReader::new(stdout).lines();

        loop {
            tokio::select! {
                _ = ctx.restart.notified() => {
                    info!("bridge restart requested");
                    let _ = child.kill().await;
                    break;
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => handle_bridge_line(&ctx, &line).await,
                        Ok(None) | Err(_) => {
                            warn!("whatsapp bridge exited");
                            break;
                        }
                    }
                }
            }
        }

        ctx.connected.store(false, Ordering::SeqCst);
        *ctx.port.lock() = None;

        tokio::time::sleep(std::time::Duration::from_secs(backoff)).await;
        backoff = next_backoff(backoff);
    }
}

async fn handle_bridge_line(ctx: &BridgeLoopCtx, line: &str) {
    let Some(event) = parse_bridge_event(line) else {
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            debug!("whatsapp bridge: {trimmed}");
        }
        return;
    };

    match event {
        BridgeEvent::Qr(code) => {
            info!("whatsapp QR code generated (scan to pair)");
            ctx.qr.set(code.clone());
            match qr::render_terminal(&code) {
                Ok(rendered) => {
                    eprintln!();
                    eprintln!("Scan in WhatsApp > Linked Devices:");
                    eprintln!("{rendered}");
                }
                Err(err) => {
                    warn!("terminal QR render failed: {err}");
                    debug!("QR payload: {code}");
                }
            }
        }
        BridgeEvent::Connected { phone, port } => {
            info!("whatsapp connected (phone: {phone})");
            ctx.connected.store(true, Ordering::SeqCst);
            *ctx.port.lock() = port;
            ctx.qr.clear();
        }
        BridgeEvent::Disconnected { reason } => {
            warn!("whatsapp disconnected: {reason}");
            ctx.connected.store(false, Ordering::SeqCst);
            if reason == "logged_out" {
                warn!("whatsapp logged out — clearing credentials, re-pair required");
                ctx.qr.clear();
                if let Err(e) = std::fs::remove_dir_all(&ctx.auth_dir) {
                    warn!("failed to clear stale auth state: {e}");
                }
            }
        }
        BridgeEvent::Message(msg) => {
            if !is_number_allowed(&ctx.allowed_numbers, &msg.from_number) {
                warn!(
                    "ignoring whatsapp message from unauthorized {}",
                    msg.from_number
                );
                return;
            }
            if let Err(e) = ctx.tx.send(msg).await {
                error!("failed to queue inbound message: {e}");
            }
        }
        BridgeEvent::Error(message) => {
            error!("whatsapp bridge error: {message}");
        }
    }
}

/// A parsed JSON-line event from the bridge's stdout.
#[derive(Debug, Clone, PartialEq)]
enum BridgeEvent {
    Qr(String),
    Connected { phone: String, port: Option<u16> },
    Disconnected { reason: String },
    Message(InboundMessage),
    Error(String),
}

/// Parse one stdout line. Returns `None` for non-JSON output (bridge logs),
/// unknown event types, and message events with no usable sender or text.
fn parse_bridge_event(line: &str) -> Option<BridgeEvent> {
    let event: Value = serde_json::from_str(line.trim()).ok()?;
    match event.get("type").and_then(Value::as_str)? {
        "qr" => {
            let data = event.get("data").and_then(Value::as_str)?;
            Some(BridgeEvent::Qr(data.to_string()))
        }
        "connected" => Some(BridgeEvent::Connected {
            phone: event
                .get("phone")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            port: event
                .get("port")
                .and_then(Value::as_u64)
                .and_then(|p| u16::try_from(p).ok()),
        }),
        "disconnected" => Some(BridgeEvent::Disconnected {
            reason: event
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
        }),
        "message" => {
            let from_number = digits_of(event.get("from").and_then(Value::as_str)?);
            let text = event
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            if from_number.is_empty() || text.is_empty() {
                return None;
            }
            Some(BridgeEvent::Message(InboundMessage {
                id: event
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                from_number,
                text,
                timestamp: event
                    .get("timestamp")
                    .and_then(Value::as_u64)
                    .unwrap_or_else(|| chrono::Utc::now().timestamp() as u64),
            }))
        }
        "error" => Some(BridgeEvent::Error(
            event
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
        )),
        _ => None,
    }
}

/// The bundled Node.js bridge script source.
///
/// Uses `whatsapp-web.js` (browser automation via Puppeteer) to connect to
/// WhatsApp Web and communicates with the Rust process via JSON lines on
/// stdout. Sends are accepted on a loopback HTTP endpoint whose port is
/// reported in the `connected` event.
const WHATSAPP_BRIDGE_JS: &str = r##"
const { Client, LocalAuth } = require('whatsapp-web.js');
const { createServer } = require('http');

const AUTH_DIR = process.env.AUTH_DIR || './auth';
const BRIDGE_PORT = parseInt(process.env.BRIDGE_PORT || '0', 10);

function emit(obj) {
    process.stdout.write(JSON.stringify(obj) + '\n');
}

const client = new Client({
    authStrategy: new LocalAuth({ dataPath: AUTH_DIR }),
    puppeteer: {
        headless: true,
        args: ['--no-sandbox', '--disable-setuid-sandbox'],
    },
});

client.on('qr', (qr) => {
    emit({ type: 'qr', data: qr });
});

client.on('ready', () => {
    const phone = client.info?.wid?.user || 'unknown';
    emit({ type: 'connected', phone, port: httpPort });
});

client.on('auth_failure', (message) => {
    emit({ type: 'error', message: `auth failure: ${message}` });
});

client.on('disconnected', (reason) => {
    if (reason === 'LOGOUT') {
        emit({ type: 'disconnected', reason: 'logged_out' });
        process.exit(0);
    }
    emit({ type: 'disconnected', reason: String(reason) });
    process.exit(1);
});

// 'message' fires for inbound only; own messages never appear here.
client.on('message', (msg) => {
    // msg.body carries the caption for media messages.
    const text = msg.body || '';
    emit({
        type: 'message',
        id: msg.id?._serialized || null,
        from: msg.from,
        text,
        timestamp: msg.timestamp || null,
    });
});

let httpPort = BRIDGE_PORT;
const server = createServer((req, res) => {
    if (req.method === 'POST' && req.url === '/send') {
        let body = '';
        req.on('data', (chunk) => { body += chunk; });
        req.on('end', async () => {
            try {
                const data = JSON.parse(body);
                if (data.type === 'send' && data.to && data.text) {
                    const chatId = data.to.includes('@') ? data.to : `${data.to}@c.us`;
                    await client.sendMessage(chatId, data.text);
                    res.writeHead(200);
                    res.end('ok');
                } else {
                    res.writeHead(400);
                    res.end('bad request');
                }
            } catch (err) {
                res.writeHead(500);
                res.end(err.message);
            }
        });
    } else {
        res.writeHead(404);
        res.end('not found');
    }
});

server.listen(BRIDGE_PORT, '127.0.0.1', () => {
    httpPort = server.address().port;
    client.initialize().catch((err) => {
        emit({ type: 'error', message: err.message });
        process.exit(1);
    });
});
"##;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_qr_event() {
        let event = parse_bridge_event(r#"{"type":"qr","data":"2@abc,def"}"#);
        assert_eq!(event, Some(BridgeEvent::Qr("2@abc,def".into())));
    }

    #[test]
    fn parse_connected_event_with_port() {
        let event = parse_bridge_event(r#"{"type":"connected","phone":"1234567890","port":38211}"#);
        assert_eq!(
            event,
            Some(BridgeEvent::Connected {
                phone: "1234567890".into(),
                port: Some(38211),
            })
        );
    }

    #[test]
    fn parse_connected_event_without_port() {
        let event = parse_bridge_event(r#"{"type":"connected","phone":"1234567890"}"#);
        assert_eq!(
            event,
            Some(BridgeEvent::Connected {
                phone: "1234567890".into(),
                port: None,
            })
        );
    }

    #[test]
    fn parse_disconnected_event() {
        let event = parse_bridge_event(r#"{"type":"disconnected","reason":"logged_out"}"#);
        assert_eq!(
            event,
            Some(BridgeEvent::Disconnected {
                reason: "logged_out".into(),
            })
        );
    }

    #[test]
    fn parse_message_normalizes_jid() {
        let event = parse_bridge_event(
            r#"{"type":"message","id":"true_123@c.us_ABC","from":"1234567890@c.us","text":"hello","timestamp":1699999999}"#,
        );
        let Some(BridgeEvent::Message(msg)) = event else {
            panic!("expected message event");
        };
        assert_eq!(msg.from_number, "1234567890");
        assert_eq!(msg.text, "hello");
        assert_eq!(msg.timestamp, 1_699_999_999);
        assert_eq!(msg.id, "true_123@c.us_ABC");
    }

    #[test]
    fn parse_message_without_id_gets_uuid() {
        let event = parse_bridge_event(
            r#"{"type":"message","from":"1234567890@c.us","text":"hi","id":null}"#,
        );
        let Some(BridgeEvent::Message(msg)) = event else {
            panic!("expected message event");
        };
        assert!(!msg.id.is_empty());
    }

    #[test]
    fn parse_message_drops_empty_text() {
        let event =
            parse_bridge_event(r#"{"type":"message","from":"1234567890@c.us","text":""}"#);
        assert_eq!(event, None);
    }

    #[test]
    fn parse_message_drops_missing_sender() {
        let event = parse_bridge_event(r#"{"type":"message","text":"orphan"}"#);
        assert_eq!(event, None);
    }

    #[test]
    fn parse_message_drops_broadcast_sender() {
        let event =
            parse_bridge_event(r#"{"type":"message","from":"status@broadcast","text":"ad"}"#);
        assert_eq!(event, None);
    }

    #[test]
    fn parse_error_event() {
        let event = parse_bridge_event(r#"{"type":"error","message":"boom"}"#);
        assert_eq!(event, Some(BridgeEvent::Error("boom".into())));
    }

    #[test]
    fn parse_ignores_non_json_log_lines() {
        assert_eq!(parse_bridge_event("puppeteer: launching chrome"), None);
        assert_eq!(parse_bridge_event(""), None);
    }

    #[test]
    fn parse_ignores_unknown_event_types() {
        assert_eq!(parse_bridge_event(r#"{"type":"presence","data":1}"#), None);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(next_backoff(1), 2);
        assert_eq!(next_backoff(16), 32);
        assert_eq!(next_backoff(32), 60);
        assert_eq!(next_backoff(60), 60);
    }

    #[test]
    fn bridge_script_emits_expected_events() {
        for needle in ["'qr'", "'ready'", "'disconnected'", "'message'", "/send"] {
            assert!(
                WHATSAPP_BRIDGE_JS.contains(needle),
                "bridge script missing {needle}"
            );
        }
    }

    #[test]
    fn unlinked_backend_reports_not_linked() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let backend = BridgeBackend::new(
            tmp.path().join("missing-auth"),
            tmp.path().join("bridge"),
            vec!["*".into()],
            QrState::new(),
        );
        assert!(!backend.is_linked());
    }

    #[test]
    fn linked_backend_reports_linked() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let auth_dir = tmp.path().join("auth");
        std::fs::create_dir_all(auth_dir.join("session")).expect("mkdir");
        let backend = BridgeBackend::new(
            auth_dir,
            tmp.path().join("bridge"),
            vec!["*".into()],
            QrState::new(),
        );
        assert!(backend.is_linked());
    }
}
