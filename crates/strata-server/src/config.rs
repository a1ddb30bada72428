//! Server configuration: `config.toml` layered with `STRATA_*` variables.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::Deserialize;
use strata_api::QueryConfig;
use strata_importer::ImporterConfig;

/// Runtime configuration, deserialised from `config.toml`.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
  pub host:               String,
  pub port:               u16,
  pub store_path:         PathBuf,
  pub blob_root:          PathBuf,
  pub auth_username:      String,
  pub auth_password_hash: String,
  #[serde(default)]
  pub importer:           ImporterConfig,
  #[serde(default)]
  pub query:              QueryConfig,
}

impl ServerConfig {
  /// Read `path` (optional) then the environment. Nested keys use a double
  /// underscore: `STRATA_IMPORTER__WORKERS=8`.
  pub fn load(path: &Path) -> anyhow::Result<Self> {
    let settings = config::Config::builder()
      .set_default("host", "127.0.0.1")?
      .set_default("port", 8420)?
      .set_default("store_path", "strata.db")?
      .set_default("blob_root", "blobs")?
      .set_default("auth_username", "admin")?
      .set_default("auth_password_hash", "")?
      .add_source(config::File::from(path).required(false))
      .add_source(config::Environment::with_prefix("STRATA").separator("__"))
      .build()
      .context("failed to read config file")?;

    let mut cfg: ServerConfig = settings
      .try_deserialize()
      .context("failed to deserialise ServerConfig")?;
    cfg.store_path = expand_tilde(&cfg.store_path);
    cfg.blob_root = expand_tilde(&cfg.blob_root);
    Ok(cfg)
  }

  pub fn address(&self) -> String { format!("{}:{}", self.host, self.port) }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = ServerConfig::load(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(cfg.port, 8420);
    assert_eq!(cfg.importer.row_limit_per_batch, 5000);
    assert_eq!(cfg.query.max_page_size, 10_000);
  }

  #[test]
  fn file_values_and_nested_tables_are_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
      &path,
      "port = 9000\nstore_path = \"/var/lib/strata.db\"\n\n[importer]\nworkers = 8\n\n[query]\nexport_chunk_size = 250\n",
    )
    .unwrap();

    let cfg = ServerConfig::load(&path).unwrap();
    assert_eq!(cfg.address(), "127.0.0.1:9000");
    assert_eq!(cfg.store_path, PathBuf::from("/var/lib/strata.db"));
    assert_eq!(cfg.importer.workers, 8);
    assert_eq!(cfg.importer.max_delivery_count, 5);
    assert_eq!(cfg.query.export_chunk_size, 250);
    assert_eq!(cfg.query.default_page_size, 1000);
  }

  #[test]
  fn tilde_expands_to_home() {
    let expanded = expand_tilde(Path::new("~/data/strata.db"));
    if let Ok(home) = std::env::var("HOME") {
      assert_eq!(expanded, PathBuf::from(home).join("data/strata.db"));
    }
    assert_eq!(expand_tilde(Path::new("/abs")), PathBuf::from("/abs"));
  }
}
