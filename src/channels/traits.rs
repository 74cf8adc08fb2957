//! Channel abstraction over the two WhatsApp client backends.
//!
//! Both backends wrap an external client library (one socket-protocol based,
//! one browser-automation based) and normalize its inbound events into
//! [`InboundMessage`]. The gateway and forwarder only ever see this trait.

use async_trait::async_trait;
use tokio::sync::mpsc;

/// WhatsApp caps a single text message at 4096 characters.
pub const MAX_TEXT_LEN: usize = 4096;

/// An inbound WhatsApp message, normalized across backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Library-assigned message id (a fresh UUID when the library has none).
    pub id: String,
    /// Digits of the originating chat's phone number — no `+`, no JID suffix.
    pub from_number: String,
    /// Extracted text content.
    pub text: String,
    /// Unix timestamp (seconds) when the gateway saw the message.
    pub timestamp: u64,
}

/// A WhatsApp client backend.
///
/// The trait surface is exactly what the gateway needs: start the event
/// loop, send a text, wipe stored credentials, report link state.
#[async_trait]
pub trait WhatsAppBackend: Send + Sync {
    /// Short backend name for logs and `/health`.
    fn name(&self) -> &'static str;

    /// Connect (or begin QR pairing) and stream normalized inbound messages.
    async fn start(&self) -> anyhow::Result<mpsc::Receiver<InboundMessage>>;

    /// Send a text message to a phone number (digits, E.164 without `+`).
    async fn send_text(&self, to_number: &str, text: &str) -> anyhow::Result<()>;

    /// Disconnect and delete stored session credentials so the next
    /// connection attempt re-pairs via QR.
    async fn reset_session(&self) -> anyhow::Result<()>;

    /// Whether the client currently holds a live connection.
    async fn is_connected(&self) -> bool;

    /// Whether credentials exist on disk (previously linked).
    fn is_linked(&self) -> bool;
}

/// Reduce a phone number or JID to bare digits.
///
/// Accepts `"+1234567890"`, `"1234567890@s.whatsapp.net"`, `"123@c.us"`,
/// or plain digits. Everything that is not an ASCII digit in the user part
/// is dropped.
pub fn digits_of(raw: &str) -> String {
    let user_part = raw
        .trim()
        .split_once('@')
        .map(|(user, _)| user)
        .unwrap_or_else(|| raw.trim());
    user_part.chars().filter(char::is_ascii_digit).collect()
}

/// Check a sender against the allowlist. `"*"` allows everyone; an empty
/// list denies everyone. Entries are compared as bare digits.
pub fn is_number_allowed(allowed: &[String], number: &str) -> bool {
    allowed
        .iter()
        .any(|n| n == "*" || digits_of(n) == number)
}

/// Split a message into chunks of at most `max_chars` characters,
/// respecting UTF-8 boundaries.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    if max_chars == 0 {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0usize;
    for ch in text.chars() {
        current.push(ch);
        count += 1;
        if count == max_chars {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
    }
    if !current.is_empty() || chunks.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digits_of_strips_jid_suffix() {
        assert_eq!(digits_of("1234567890@s.whatsapp.net"), "1234567890");
        assert_eq!(digits_of("1234567890@c.us"), "1234567890");
    }

    #[test]
    fn digits_of_strips_plus_and_spaces() {
        assert_eq!(digits_of("+1 234 567-890"), "1234567890");
        assert_eq!(digits_of("  +49123  "), "49123");
    }

    #[test]
    fn digits_of_plain_number_unchanged() {
        assert_eq!(digits_of("1234567890"), "1234567890");
    }

    #[test]
    fn digits_of_non_numeric_is_empty() {
        assert_eq!(digits_of("status@broadcast"), "");
    }

    #[test]
    fn allowlist_wildcard_allows_all() {
        let allowed = vec!["*".to_string()];
        assert!(is_number_allowed(&allowed, "1234567890"));
        assert!(is_number_allowed(&allowed, "9999999999"));
    }

    #[test]
    fn allowlist_exact_match() {
        let allowed = vec!["+1234567890".to_string()];
        assert!(is_number_allowed(&allowed, "1234567890"));
        assert!(!is_number_allowed(&allowed, "9876543210"));
    }

    #[test]
    fn allowlist_empty_denies_all() {
        assert!(!is_number_allowed(&[], "1234567890"));
    }

    #[test]
    fn split_message_short_passthrough() {
        let chunks = split_message("hello", 4096);
        assert_eq!(chunks, vec!["hello".to_string()]);
    }

    #[test]
    fn split_message_exact_boundary() {
        let text = "a".repeat(8);
        let chunks = split_message(&text, 4);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 4);
        assert_eq!(chunks[1].len(), 4);
    }

    #[test]
    fn split_message_unicode_safe() {
        let text = "日本語テスト".repeat(3);
        let chunks = split_message(&text, 5);
        assert_eq!(chunks.concat(), text);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 5);
        }
    }

    #[test]
    fn split_message_empty_returns_one_chunk() {
        assert_eq!(split_message("", 100), vec![String::new()]);
    }
}
