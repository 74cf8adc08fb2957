//! Last-QR state and rendering.
//!
//! The pairing QR is a single mutable value: each pairing challenge from the
//! client library overwrites it, and a successful login or an auth reset
//! clears it. Most recent value wins — there is no history.

use anyhow::anyhow;
use image::ImageEncoder;
use parking_lot::Mutex;
use std::sync::Arc;

/// Pixels per QR module in the PNG render.
const PNG_MODULE_SCALE: u32 = 8;
/// Quiet-zone width around the PNG render, in modules.
const PNG_QUIET_ZONE: u32 = 4;

/// Shared handle to the most recent pairing QR payload.
#[derive(Clone, Default)]
pub struct QrState {
    inner: Arc<Mutex<Option<String>>>,
}

impl QrState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite with the latest pairing challenge.
    pub fn set(&self, code: impl Into<String>) {
        *self.inner.lock() = Some(code.into());
    }

    /// Clear on successful login or reset.
    pub fn clear(&self) {
        *self.inner.lock() = None;
    }

    pub fn current(&self) -> Option<String> {
        self.inner.lock().clone()
    }
}

/// Render a pairing QR payload into terminal-friendly Unicode half-blocks.
pub fn render_terminal(payload: &str) -> anyhow::Result<String> {
    let payload = payload.trim();
    if payload.is_empty() {
        anyhow::bail!("QR payload is empty");
    }

    let qr = qrcode::QrCode::new(payload.as_bytes())
        .map_err(|err| anyhow!("failed to encode QR payload: {err}"))?;

    Ok(qr
        .render::<qrcode::render::unicode::Dense1x2>()
        .quiet_zone(true)
        .build())
}

/// Render a pairing QR payload as a grayscale PNG.
pub fn render_png(payload: &str) -> anyhow::Result<Vec<u8>> {
    let payload = payload.trim();
    if payload.is_empty() {
        anyhow::bail!("QR payload is empty");
    }

    let qr = qrcode::QrCode::new(payload.as_bytes())
        .map_err(|err| anyhow!("failed to encode QR payload: {err}"))?;

    let width = qr.width();
    let colors = qr.into_colors();
    let size = (width as u32 + PNG_QUIET_ZONE * 2) * PNG_MODULE_SCALE;
    let mut img = image::GrayImage::from_pixel(size, size, image::Luma([255u8]));

    for (idx, color) in colors.iter().enumerate() {
        if *color != qrcode::Color::Dark {
            continue;
        }
        let mx = (idx % width) as u32 + PNG_QUIET_ZONE;
        let my = (idx / width) as u32 + PNG_QUIET_ZONE;
        for dy in 0..PNG_MODULE_SCALE {
            for dx in 0..PNG_MODULE_SCALE {
                img.put_pixel(
                    mx * PNG_MODULE_SCALE + dx,
                    my * PNG_MODULE_SCALE + dy,
                    image::Luma([0u8]),
                );
            }
        }
    }

    let mut png = Vec::new();
    image::codecs::png::PngEncoder::new(&mut png).write_image(
        img.as_raw(),
        size,
        size,
        image::ExtendedColorType::L8,
    )?;
    Ok(png)
}
