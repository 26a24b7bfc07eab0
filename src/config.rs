use std::path::Path;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use rustls::{Certificate, PrivateKey};
use serde_derive::{Deserialize, Serialize};
use tracing::info;

use crate::transport::SERVER_NAME;

/// Everything a node needs to join the cluster: the shared certificate and
/// where the queue listens.
#[derive(Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(with = "CertificatedDef")]
    pub cert: Certificate,
    #[serde(with = "PrivateKeyDef")]
    pub key: PrivateKey,
    /// `host:port` of the queue server.
    pub server: String,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config").field("server", &self.server).finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize)]
#[serde(remote = "Certificate")]
struct CertificatedDef(Vec<u8>);

#[derive(Serialize, Deserialize)]
#[serde(remote = "PrivateKey")]
struct PrivateKeyDef(Vec<u8>);

pub fn read_config(path: &Path) -> anyhow::Result<Config> {
    let config = std::fs::read(path)
        .with_context(|| format!("Failed to read config at {}, run `jobswarm init` or `jobswarm join`", path.display()))?;
    postcard::from_bytes(&config).context("Failed to deserialize config")
}

fn write_config(path: &Path, config: &Config) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, postcard::to_allocvec(config)?)?;
    info!(path = %path.display(), server = %config.server, "config written");
    Ok(())
}

/// Creates a fresh cluster identity pointing at `server`.
pub fn generate_config(path: &Path, server: String) -> anyhow::Result<Config> {
    let cert = rcgen::generate_simple_self_signed(vec![SERVER_NAME.into()])?;
    let config = Config {
        cert: Certificate(cert.serialize_der()?),
        key: PrivateKey(cert.serialize_private_key_der()),
        server,
    };
    write_config(path, &config)?;
    Ok(config)
}

/// Packs a config into a token other nodes can `join` with.
pub fn serialize_config(config: &Config) -> anyhow::Result<String> {
    let bin = postcard::to_allocvec(config)?;
    let mut result = Vec::new();
    zstd::stream::copy_encode(bin.as_slice(), &mut result, 22)?;

    Ok(STANDARD_NO_PAD.encode(&result))
}

pub fn deserialize_config(token: &str) -> anyhow::Result<Config> {
    let compressed = STANDARD_NO_PAD.decode(token.trim().as_bytes()).context("Token is not valid base64")?;
    let mut decompressed = Vec::new();
    zstd::stream::copy_decode(&compressed[..], &mut decompressed)?;
    Ok(postcard::from_bytes(&decompressed)?)
}

pub fn write_serialized_config(path: &Path, token: &str, server: Option<String>) -> anyhow::Result<Config> {
    let mut config = deserialize_config(token)?;
    if let Some(server) = server {
        config.server = server;
    }
    write_config(path, &config)?;
    Ok(config)
}
