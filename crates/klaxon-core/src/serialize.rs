//! Canonical serialization
//!
//! Renders a compiled configuration to YAML, gzips it, and digests the
//! compressed bytes. The YAML field order is fixed by the render structs
//! and all maps are ordered, and the gzip header carries no timestamp, so
//! re-serializing an unchanged configuration reproduces the prior
//! artifact byte for byte.

use crate::compiled::CompiledConfiguration;
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::io::Write;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("failed to render configuration document: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("failed to compress configuration document: {0}")]
    Compress(#[from] std::io::Error),
}

/// The immutable output of one successful compile: compressed canonical
/// document, content digest, generation timestamp. Superseded, never
/// mutated, by the next compile.
#[derive(Clone, Debug)]
pub struct Artifact {
    pub compressed: Vec<u8>,
    pub digest: String,
    pub generated_at: DateTime<Utc>,
}

/// Serialize, compress and digest a compiled configuration.
pub fn serialize(configuration: &CompiledConfiguration) -> Result<Artifact, SerializeError> {
    let yaml = serde_yaml::to_string(configuration)?;
    let compressed = gzip(yaml.as_bytes())?;
    let digest = digest_hex(&compressed);
    Ok(Artifact {
        compressed,
        digest,
        generated_at: Utc::now(),
    })
}

/// SHA-256 of the given bytes, lowercase hex.
pub fn digest_hex(bytes: &[u8]) -> String {
    let hash = Sha256::digest(bytes);
    hash.iter().map(|b| format!("{b:02x}")).collect()
}

fn gzip(bytes: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}
