//! Artifact descriptor metadata
//!
//! This module extracts the optional details shown in listings from an
//! artifact's `config.json`: architecture family, an estimated parameter
//! size and the quantization level. A missing or malformed descriptor never
//! fails a listing; the fields are simply left empty.

use serde::Deserialize;
use std::path::Path;
use tracing::debug;

use common::models::ArtifactDetails;

/// Name of the descriptor file every usable artifact carries
pub const DESCRIPTOR_FILE: &str = "config.json";

/// Subset of a transformer `config.json` used for details
#[derive(Debug, Default, Deserialize)]
struct Descriptor {
    #[serde(default)]
    architectures: Vec<String>,
    hidden_size: Option<u64>,
    num_hidden_layers: Option<u64>,
    vocab_size: Option<u64>,
    intermediate_size: Option<u64>,
    num_attention_heads: Option<u64>,
    num_key_value_heads: Option<u64>,
    #[serde(default)]
    tie_word_embeddings: Option<bool>,
    quantization: Option<Quantization>,
}

#[derive(Debug, Deserialize)]
struct Quantization {
    bits: Option<u64>,
}

/// Reads details from `<dir>/config.json`
pub fn read_details(dir: &Path, format: &str) -> ArtifactDetails {
    let mut details = ArtifactDetails {
        format: format.to_string(),
        ..Default::default()
    };

    let path = dir.join(DESCRIPTOR_FILE);
    let descriptor = match std::fs::read(&path) {
        Ok(bytes) => match serde_json::from_slice::<Descriptor>(&bytes) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                debug!("Ignoring unparsable descriptor {:?}: {}", path, e);
                return details;
            }
        },
        Err(e) => {
            debug!("No readable descriptor at {:?}: {}", path, e);
            return details;
        }
    };

    details.family = descriptor.architectures.first().cloned();
    details.parameter_size = estimate_parameters(&descriptor).map(format_parameter_count);
    details.quantization_level = descriptor
        .quantization
        .and_then(|q| q.bits)
        .map(|bits| format!("Q{}", bits));

    details
}

/// Approximates the parameter count of a decoder-only transformer
///
/// Counts embeddings, attention projections (grouped-query aware) and a gated
/// MLP per layer. Norms and biases are ignored. Sizes whose product does not
/// fit a `u64` yield `None`.
fn estimate_parameters(d: &Descriptor) -> Option<u64> {
    let hidden = d.hidden_size?;
    let layers = d.num_hidden_layers?;
    let vocab = d.vocab_size?;
    let intermediate = match d.intermediate_size {
        Some(size) => size,
        None => hidden.checked_mul(4)?,
    };

    let heads = d.num_attention_heads.unwrap_or(1).max(1);
    let kv_heads = d.num_key_value_heads.unwrap_or(heads);
    let kv_dim = (hidden / heads).checked_mul(kv_heads)?;

    let attention = hidden
        .checked_mul(hidden)?
        .checked_add(hidden.checked_mul(kv_dim)?)?
        .checked_mul(2)?;
    let mlp = hidden.checked_mul(intermediate)?.checked_mul(3)?;

    let mut embeddings = vocab.checked_mul(hidden)?;
    if !d.tie_word_embeddings.unwrap_or(false) {
        embeddings = embeddings.checked_mul(2)?;
    }

    layers
        .checked_mul(attention.checked_add(mlp)?)?
        .checked_add(embeddings)
}

/// Renders a parameter count as `135M`, `1.2B`, `7B`
pub fn format_parameter_count(count: u64) -> String {
    const SCALES: [(f64, &str); 4] = [(1e12, "T"), (1e9, "B"), (1e6, "M"), (1e3, "K")];

    let value = count as f64;
    for (scale, suffix) in SCALES {
        if value >= scale {
            let rendered = format!("{:.1}", value / scale);
            let rendered = rendered.strip_suffix(".0").unwrap_or(&rendered);
            return format!("{}{}", rendered, suffix);
        }
    }
    count.to_string()
}

/// Parses a human parameter size such as `7b`, `1.5 billion` or `7,000,000,000`
///
/// Returns 0 for anything it cannot interpret.
pub fn parse_parameter_count(text: &str) -> u64 {
    let normalized: String = text
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',' && *c != '_')
        .collect();

    let split = normalized
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(normalized.len());
    let (number, suffix) = normalized.split_at(split);

    let multiplier = match suffix {
        "" => 1.0,
        "k" | "thousand" => 1e3,
        "m" | "million" => 1e6,
        "b" | "billion" => 1e9,
        "t" | "trillion" => 1e12,
        _ => return 0,
    };

    match number.parse::<f64>() {
        Ok(n) if n.is_finite() && n >= 0.0 => (n * multiplier).round() as u64,
        _ => 0,
    }
}
