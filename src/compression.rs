//! Prompt-compression boundary.
//!
//! The real compression subsystem is an external collaborator; the core only
//! depends on this seam. Sections of a message wrapped in
//! `<compress>…</compress>` are eligible for compression; everything outside
//! the markers (sandbox output, error text, task instructions) must reach
//! the model verbatim. Markers themselves never reach the provider.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompressionConfig {
    pub enabled: bool,
    pub rate: f64,
    pub preserve_code_blocks: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self { enabled: true, rate: 0.5, preserve_code_blocks: true }
    }
}

/// Metrics reported by a transform pass, recorded alongside usage.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompressionMetrics {
    pub blocks_compressed: usize,
    pub original_chars: usize,
    pub compressed_chars: usize,
}

/// A text transform applied to compressible sections before transmission.
pub trait TextTransform: Send + Sync {
    /// Transform the content of one `<compress>` block.
    fn transform(&self, text: &str, config: &CompressionConfig) -> String;
}

/// Default transform: returns the text unchanged. The marker protocol and
/// metrics plumbing stay exercised so a real compressor can be dropped in.
pub struct PassThrough;

impl TextTransform for PassThrough {
    fn transform(&self, text: &str, _config: &CompressionConfig) -> String {
        text.to_string()
    }
}

/// Apply the transform to every `<compress>` block in `content` and strip
/// the markers. Text outside the markers is returned byte-for-byte.
pub fn prepare_content(
    content: &str,
    config: &CompressionConfig,
    transform: &dyn TextTransform,
) -> (String, CompressionMetrics) {
    let mut metrics = CompressionMetrics::default();
    let mut out = String::with_capacity(content.len());
    let mut rest = content;

    while let Some(open) = rest.find("<compress>") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + "<compress>".len()..];
        match after_open.find("</compress>") {
            Some(close) => {
                let block = &after_open[..close];
                let compressed = if config.enabled {
                    transform.transform(block, config)
                } else {
                    block.to_string()
                };
                metrics.blocks_compressed += 1;
                metrics.original_chars += block.len();
                metrics.compressed_chars += compressed.len();
                out.push_str(&compressed);
                rest = &after_open[close + "</compress>".len()..];
            }
            None => {
                // Unbalanced marker: drop the marker, keep the text.
                rest = after_open;
            }
        }
    }
    out.push_str(rest);
    (out, metrics)
}
