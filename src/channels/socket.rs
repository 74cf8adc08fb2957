//! Socket backend — wraps the `whatsapp-rust` WhatsApp Web client.
//!
//! Speaks the multi-device protocol natively (Noise handshake + Signal
//! encryption, all supplied by the library). Session credentials are
//! persisted by the library's store at `{data_dir}/session/whatsapp.db`;
//! this module only chooses that path and deletes it on reset.

use super::traits::{
    digits_of, is_number_allowed, split_message, InboundMessage, WhatsAppBackend, MAX_TEXT_LEN,
};
use crate::qr::{self, QrState};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};
use wacore::types::events::Event;
use wacore_binary::jid::Jid;
use whatsapp_rust::bot::Bot;
use whatsapp_rust::client::Client;
use whatsapp_rust_tokio_transport::TokioWebSocketTransportFactory;
use whatsapp_rust_ureq_http_client::UreqHttpClient;

pub struct SocketBackend {
    session_dir: PathBuf,
    device_name: String,
    allowed_numbers: Vec<String>,
    qr: QrState,
    /// Client handle for sending — set once the bot connects.
    client: Arc<Mutex<Option<Arc<Client>>>>,
}

impl SocketBackend {
    pub fn new(
        session_dir: PathBuf,
        device_name: String,
        allowed_numbers: Vec<String>,
        qr: QrState,
    ) -> Self {
        Self {
            session_dir,
            device_name,
            allowed_numbers,
            qr,
            client: Arc::new(Mutex::new(None)),
        }
    }

    /// Path of the library-owned session database.
    fn session_db_path(&self) -> PathBuf {
        self.session_dir.join("whatsapp.db")
    }

    async fn build_and_run_bot(&self, tx: mpsc::Sender<InboundMessage>) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.session_dir).with_context(|| {
            format!("failed to create session dir {}", self.session_dir.display())
        })?;
        let db_path = self.session_db_path();
        info!("whatsapp bot building (session: {})", db_path.display());

        let backend = Arc::new(
            whatsapp_rust::store::SqliteStore::new(&db_path.to_string_lossy())
                .await
                .map_err(|e| anyhow!("session store init failed: {e}"))?,
        );

        let allowed = self.allowed_numbers.clone();
        let client_for_event = self.client.clone();
        let qr_state = self.qr.clone();
        let session_dir = self.session_dir.clone();

        let mut bot = Bot::builder()
            .with_backend(backend)
            .with_transport_factory(TokioWebSocketTransportFactory::new())
            .with_http_client(UreqHttpClient::new())
            .with_device_props(
                Some(self.device_name.clone()),
                None,
                Some(waproto::whatsapp::device_props::PlatformType::Desktop),
            )
            .on_event(move |event, client| {
                let tx = tx.clone();
                let allowed = allowed.clone();
                let client_store = client_for_event.clone();
                let qr_state = qr_state.clone();
                let session_dir = session_dir.clone();
                async move {
                    match event {
                        Event::PairingQrCode { code, .. } => {
                            info!("whatsapp QR code generated (scan to pair)");
                            qr_state.set(code.clone());
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
                        Event::PairSuccess(_) => {
                            info!("whatsapp pairing successful");
                            qr_state.clear();
                        }
                        Event::Connected(_) => {
                            info!("whatsapp connected");
                            *client_store.lock().await = Some(client);
                            qr_state.clear();
                        }
                        Event::Disconnected(_) => {
                            warn!("whatsapp disconnected");
                            *client_store.lock().await = None;
                        }
                        Event::LoggedOut(_) => {
                            warn!("whatsapp logged out — clearing credentials, re-pair required");
                            *client_store.lock().await = None;
                            qr_state.clear();
                            if let Err(e) = std::fs::remove_dir_all(&session_dir) {
                                warn!("failed to clear stale session: {e}");
                            }
                        }
                        Event::Message(msg, message_info) => {
                            handle_message(*msg, message_info, &tx, &allowed).await;
                        }
                        _ => {}
                    }
                }
            })
            .build()
            .await
            .map_err(|e| anyhow!("whatsapp bot build failed: {e}"))?;

        *self.client.lock().await = Some(bot.client());

        let _handle = bot
            .run()
            .await
            .map_err(|e| anyhow!("whatsapp bot run failed: {e}"))?;

        info!("whatsapp bot started");
        Ok(())
    }
}

#[async_trait]
impl WhatsAppBackend for SocketBackend {
    fn name(&self) -> &'static str {
        "socket"
    }

    async fn start(&self) -> anyhow::Result<mpsc::Receiver<InboundMessage>> {
        let (tx, rx) = mpsc::channel(64);
        self.build_and_run_bot(tx).await?;
        Ok(rx)
    }

    async fn send_text(&self, to_number: &str, text: &str) -> anyhow::Result<()> {
        let client = self
            .client
            .lock()
            .await
            .clone()
            .ok_or_else(|| anyhow!("whatsapp client not connected"))?;

        let jid = to_jid(to_number)?;
        for chunk in split_message(text, MAX_TEXT_LEN) {
            let msg = waproto::whatsapp::Message {
                conversation: Some(chunk),
                ..Default::default()
            };
            let msg_id = client
                .send_message(jid.clone(), msg)
                .await
                .map_err(|e| anyhow!("whatsapp send failed: {e}"))?;
            debug!("sent text to {to_number} (id: {msg_id})");
        }
        Ok(())
    }

    async fn reset_session(&self) -> anyhow::Result<()> {
        *self.client.lock().await = None;
        self.qr.clear();
        if self.session_dir.exists() {
            std::fs::remove_dir_all(&self.session_dir).with_context(|| {
                format!("failed to delete session at {}", self.session_dir.display())
            })?;
            info!("whatsapp session cleared — re-pair with QR required");
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.client.lock().await.is_some()
    }

    fn is_linked(&self) -> bool {
        // The store file appears after the first run; treated as "linked"
        // the same way a Baileys creds file is.
        self.session_db_path().exists()
    }
}

/// Convert bare digits (or an E.164 number) to a user JID.
fn to_jid(to_number: &str) -> anyhow::Result<Jid> {
    let digits = digits_of(to_number);
    if digits.is_empty() {
        anyhow::bail!("recipient `{to_number}` does not contain a phone number");
    }
    format!("{digits}@s.whatsapp.net")
        .parse::<Jid>()
        .map_err(|e| anyhow!("invalid whatsapp JID for `{to_number}`: {e}"))
}

/// Process one inbound message event: filter, normalize, forward.
async fn handle_message(
    msg: waproto::whatsapp::Message,
    info: wacore::types::message::MessageInfo,
    tx: &mpsc::Sender<InboundMessage>,
    allowed: &[String],
) {
    // Own echoes are never forwarded.
    if info.source.is_from_me {
        return;
    }

    let from_number = digits_of(&info.source.chat.user);
    let text = extract_text(unwrap_nested(&msg));
    if from_number.is_empty() || text.is_empty() {
        debug!("dropping message without sender number or text");
        return;
    }

    if !is_number_allowed(allowed, &from_number) {
        warn!("ignoring whatsapp message from unauthorized {from_number}");
        return;
    }

    let inbound = InboundMessage {
        id: info.id.clone(),
        from_number,
        text,
        timestamp: chrono::Utc::now().timestamp() as u64,
    };
    if let Err(e) = tx.send(inbound).await {
        error!("failed to queue inbound message: {e}");
    }
}

/// Unwrap device-sent / ephemeral / view-once wrappers down to the payload.
fn unwrap_nested(msg: &waproto::whatsapp::Message) -> &waproto::whatsapp::Message {
    msg.device_sent_message
        .as_ref()
        .and_then(|d| d.message.as_deref())
        .or_else(|| {
            msg.ephemeral_message
                .as_ref()
                .and_then(|e| e.message.as_deref())
        })
        .or_else(|| {
            msg.view_once_message
                .as_ref()
                .and_then(|v| v.message.as_deref())
        })
        .unwrap_or(msg)
}

/// Extract displayable text: plain conversation, then extended text, then
/// an image caption.
fn extract_text(msg: &waproto::whatsapp::Message) -> String {
    msg.conversation
        .as_deref()
        .or_else(|| {
            msg.extended_text_message
                .as_ref()
                .and_then(|e| e.text.as_deref())
        })
        .or_else(|| {
            msg.image_message
                .as_ref()
                .and_then(|i| i.caption.as_deref())
        })
        .unwrap_or("")
        .to_string()
}
