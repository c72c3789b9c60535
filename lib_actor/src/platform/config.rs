//! Persistent configuration store.
//!
//! One file, owner-only readable, with a single `[uds]` section. The
//! `config` and `data` blobs are base64 of their JSON representation.
//! Writes are atomic: tempfile in the same directory, fsync, rename, then
//! permissions. A reader that cannot make sense of the document yields a
//! null configuration (the agent refuses to run instead of crashing).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::io::Write;

use crate::consts;
use crate::error::{ActorError, Result};
use crate::types::{ActorConfiguration, ActorKind, DataConfiguration};

#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Reads the stored configuration. Never fails: any parse problem yields
    /// an empty (null) configuration.
    async fn read(&self) -> ActorConfiguration;

    /// Atomically replaces the stored configuration.
    async fn write(&self, config: &ActorConfiguration) -> Result<()>;

    /// Optional hook executed when a user logs in.
    async fn script_on_login(&self) -> String;
}

/// On-disk document layout. Only the keys with values are written.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigDocument {
    #[serde(default)]
    uds: UdsSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UdsSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    actor_type: Option<ActorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    validate: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<String>,
    // Pre-4.0 documents carried two tokens instead of one.
    #[serde(skip_serializing_if = "Option::is_none")]
    master_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    own_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    initialized: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    restrict_net: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pre_command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    runonce_command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    post_command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    log_level: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    config: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    script_on_login: Option<String>,
}

/// File-backed store used on every supported OS; only the path and the
/// permission mechanism differ per platform.
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: PathBuf) -> Self {
        FileConfigStore { path }
    }

    pub fn system() -> Self {
        FileConfigStore::new(consts::config_file())
    }

    fn parse(&self, content: &str) -> Option<ActorConfiguration> {
        let document: ConfigDocument = toml::from_str(content).ok()?;
        let uds = document.uds;

        let version = u32::from_str_radix(uds.version.as_deref().unwrap_or("0"), 16).ok()?;

        let (token, data_config, data) = match version {
            0 => {
                // Legacy document: two token keys, blobs in a foreign binary
                // encoding we cannot decode. The token migrates; the blobs
                // are rebuilt by the next initialize.
                let token = uds
                    .master_token
                    .clone()
                    .filter(|t| !t.is_empty())
                    .or_else(|| uds.own_token.clone().filter(|t| !t.is_empty()));
                (token, None, None)
            }
            v if v == consts::CONFIG_VERSION => {
                let data_config: Option<DataConfiguration> = uds
                    .config
                    .as_deref()
                    .and_then(decode_blob)
                    .and_then(|v| serde_json::from_value(v).ok());
                let data = uds.data.as_deref().and_then(decode_blob);
                (uds.token.clone().filter(|t| !t.is_empty()), data_config, data)
            }
            _ => return None, // Unknown schema, refuse to guess
        };

        Some(ActorConfiguration {
            version,
            actor_kind: uds.actor_type.unwrap_or_default(),
            token,
            initialized: uds.initialized.unwrap_or(false),
            host: uds.host.unwrap_or_default(),
            validate_certificate: uds.validate.unwrap_or(true),
            restrict_net: uds.restrict_net.filter(|s| !s.is_empty()),
            pre_command: uds.pre_command.filter(|s| !s.is_empty()),
            runonce_command: uds.runonce_command.filter(|s| !s.is_empty()),
            post_command: uds.post_command.filter(|s| !s.is_empty()),
            log_level: uds.log_level.unwrap_or(2),
            data_config,
            data,
        })
    }
}

fn decode_blob(blob: &str) -> Option<serde_json::Value> {
    let raw = base64::engine::general_purpose::STANDARD.decode(blob).ok()?;
    serde_json::from_slice(&raw).ok()
}

fn encode_blob<T: Serialize>(value: &T) -> Option<String> {
    let raw = serde_json::to_vec(value).ok()?;
    Some(base64::engine::general_purpose::STANDARD.encode(raw))
}

#[cfg(unix)]
fn protect_owner_only(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(windows)]
fn protect_owner_only(path: &Path) -> std::io::Result<()> {
    // Replace inherited ACLs with a SYSTEM/Administrators only set.
    std::process::Command::new("icacls")
        .args([
            path.as_os_str().to_string_lossy().as_ref(),
            "/inheritance:r",
            "/grant:r",
            "*S-1-5-18:F",
            "/grant:r",
            "*S-1-5-32-544:F",
        ])
        .output()
        .map(|_| ())
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn read(&self) -> ActorConfiguration {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|content| self.parse(&content))
            .unwrap_or_default()
    }

    async fn write(&self, config: &ActorConfiguration) -> Result<()> {
        let document = ConfigDocument {
            uds: UdsSection {
                // Always stamped with the current schema version, in hex
                version: Some(format!("{:x}", consts::CONFIG_VERSION)),
                actor_type: Some(config.actor_kind),
                host: Some(config.host.clone()),
                validate: Some(config.validate_certificate),
                token: config.token.clone(),
                master_token: None,
                own_token: None,
                initialized: Some(config.initialized),
                restrict_net: config.restrict_net.clone(),
                pre_command: config.pre_command.clone(),
                runonce_command: config.runonce_command.clone(),
                post_command: config.post_command.clone(),
                log_level: Some(config.log_level),
                config: config.data_config.as_ref().and_then(encode_blob),
                data: config.data.as_ref().and_then(encode_blob),
                script_on_login: None,
            },
        };

        let content = toml::to_string(&document)
            .map_err(|e| ActorError::Config(format!("serialize: {e}")))?;

        let directory = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        if !directory.exists() {
            std::fs::create_dir_all(&directory)
                .map_err(|e| ActorError::Config(format!("create {}: {e}", directory.display())))?;
        }

        let mut temp = tempfile::NamedTempFile::new_in(&directory)
            .map_err(|e| ActorError::Config(format!("tempfile: {e}")))?;
        temp.write_all(content.as_bytes())
            .map_err(|e| ActorError::Config(format!("write: {e}")))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| ActorError::Config(format!("sync: {e}")))?;
        temp.persist(&self.path)
            .map_err(|e| ActorError::Config(format!("replace: {e}")))?;

        protect_owner_only(&self.path)
            .map_err(|e| ActorError::Config(format!("permissions: {e}")))?;
        Ok(())
    }

    async fn script_on_login(&self) -> String {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|content| toml::from_str::<ConfigDocument>(&content).ok())
            .and_then(|d| d.uds.script_on_login)
            .unwrap_or_default()
    }
}
