//! WhatsApp client backends.
//!
//! Two wrapped libraries, one trait. The socket backend speaks the
//! multi-device protocol natively via `whatsapp-rust`; the bridge backend
//! drives WhatsApp Web through `whatsapp-web.js` browser automation in a
//! Node.js sidecar. Selection is a config key.

pub mod bridge;
#[cfg(feature = "socket")]
pub mod socket;
pub mod traits;

pub use bridge::BridgeBackend;
#[cfg(feature = "socket")]
pub use socket::SocketBackend;
pub use traits::{InboundMessage, WhatsAppBackend};

use crate::config::{ClientBackend, Config};
use crate::qr::QrState;
use std::sync::Arc;

/// Build the configured backend.
pub fn create_backend(config: &Config, qr: QrState) -> anyhow::Result<Arc<dyn WhatsAppBackend>> {
    match config.whatsapp.backend {
        ClientBackend::Socket => {
            #[cfg(feature = "socket")]
            {
                Ok(Arc::new(SocketBackend::new(
                    config.session_dir(),
                    config.whatsapp.device_name.clone(),
                    config.whatsapp.allowed_numbers.clone(),
                    qr,
                )))
            }
            #[cfg(not(feature = "socket"))]
            {
                anyhow::bail!(
                    "this build does not include the socket backend; \
                     rebuild with `--features socket` or set backend = \"bridge\""
                )
            }
        }
        ClientBackend::Bridge => Ok(Arc::new(BridgeBackend::new(
            config.bridge_auth_dir(),
            config.bridge_dir(),
            config.whatsapp.allowed_numbers.clone(),
            qr,
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_backend_honors_config() {
        let mut config = Config::default();
        config.whatsapp.backend = ClientBackend::Bridge;
        let backend = create_backend(&config, QrState::new()).expect("bridge backend");
        assert_eq!(backend.name(), "bridge");
    }

    #[cfg(feature = "socket")]
    #[test]
    fn create_backend_defaults_to_socket() {
        let config = Config::default();
        let backend = create_backend(&config, QrState::new()).expect("socket backend");
        assert_eq!(backend.name(), "socket");
    }
}
