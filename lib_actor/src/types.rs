//! Data model shared by the broker client, the message router, the local
//! server and the lifecycle.
//!
//! Everything here is plain data with serde derives; field names (and the
//! legacy aliases) are part of the wire contract and must not drift.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

/// Converts any serializable view into its JSON payload form.
///
/// Serialization of the types in this module cannot fail; a defensive `Null`
/// keeps the signature infallible for callers building messages inline.
pub fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

// ---------------------------------------------------------------------------
// Actor identity & configuration
// ---------------------------------------------------------------------------

/// Whether the broker assigns this machine a stable identity on first contact
/// (managed) or hands out per-user-service tokens at session time (unmanaged).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorKind {
    #[default]
    Managed,
    Unmanaged,
}

impl std::fmt::Display for ActorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorKind::Managed => f.write_str("managed"),
            ActorKind::Unmanaged => f.write_str("unmanaged"),
        }
    }
}

/// First-boot OS action requested by the broker on `initialize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsAction {
    #[default]
    None,
    Rename,
    RenameAd,
}

/// OS related portion of the broker-provided data configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OsConfiguration {
    #[serde(default)]
    pub action: OsAction,
    #[serde(default)]
    pub name: String,
    /// Free-form parameters (domain join credentials, ou, markers...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<serde_json::Map<String, Value>>,
}

/// Broker-provided data stored alongside the configuration after initialize.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DataConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<OsConfiguration>,
}

/// The persistent identity of the agent. Loaded once per boot, re-written
/// only when its content legitimately advances (token exchange, runonce
/// consumed, os action done).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorConfiguration {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub actor_kind: ActorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// True once the install-time token has been exchanged for the
    /// machine-bound one.
    #[serde(default)]
    pub initialized: bool,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_true")]
    pub validate_certificate: bool,
    /// CIDR restricting which NIC is "the" service NIC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restrict_net: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runonce_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_command: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_config: Option<DataConfiguration>,
    /// Opaque extra data kept for the broker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> i32 {
    2
}

impl Default for ActorConfiguration {
    fn default() -> Self {
        ActorConfiguration {
            version: 0,
            actor_kind: ActorKind::Managed,
            token: None,
            initialized: false,
            host: String::new(),
            validate_certificate: true,
            restrict_net: None,
            pre_command: None,
            runonce_command: None,
            post_command: None,
            log_level: default_log_level(),
            data_config: None,
            data: None,
        }
    }
}

impl ActorConfiguration {
    /// A null configuration means "not configured": the agent refuses to
    /// serve and the lifecycle exits at boot.
    pub fn is_null(&self) -> bool {
        self.host.is_empty() || self.token.is_none()
    }
}

// ---------------------------------------------------------------------------
// Network & certificates
// ---------------------------------------------------------------------------

/// One usable network interface. Loopback (169.254/16) and null-MAC entries
/// are filtered out at the source, never here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    pub name: String,
    /// Uppercase colon-separated hex.
    pub mac: String,
    pub ip: String,
}

/// The PEM key + certificate + password triple delivered by the broker, used
/// as the local server TLS identity. Ephemeral: never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CertificateInfo {
    #[serde(rename = "private_key", alias = "key")]
    pub key: String,
    #[serde(rename = "server_certificate", alias = "certificate")]
    pub certificate: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub ciphers: String,
}

/// Outcome of the broker `initialize` exchange.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InitializationResult {
    pub token: Option<String>,
    pub unique_id: Option<String>,
    pub os: Option<OsConfiguration>,
}

/// One login realm, as enumerated from the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authenticator {
    #[serde(rename = "authId")]
    pub auth_id: String,
    #[serde(rename = "authSmallName")]
    pub auth_small_name: String,
    pub auth: String,
    #[serde(rename = "type")]
    pub auth_type: String,
    pub priority: i32,
    #[serde(rename = "isCustom")]
    pub is_custom: bool,
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Message kinds multiplexed between broker, router and user client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Message,
    Screenshot,
    Preconnect,
    Script,
    Login,
    Logout,
    Close,
    Ping,
    Pong,
    Log,
    Ok,
}

/// Reply channel attached to in-process synchronous flows (currently only
/// the private `user_login`). The router fulfils it after the actor responds.
pub type ReplySender = oneshot::Sender<std::result::Result<Value, String>>;

/// Tagged message with a schemaless payload. Serializes as
/// `{"msg_type": ..., "data": ...}`; the reply channel never crosses the wire.
#[derive(Debug, Serialize, Deserialize)]
pub struct UdsMessage {
    pub msg_type: MessageKind,
    #[serde(default)]
    pub data: Value,
    #[serde(skip)]
    pub callback: Option<ReplySender>,
}

impl UdsMessage {
    pub fn new(msg_type: MessageKind, data: Value) -> Self {
        UdsMessage {
            msg_type,
            data,
            callback: None,
        }
    }

    pub fn with_callback(msg_type: MessageKind, data: Value, callback: ReplySender) -> Self {
        UdsMessage {
            msg_type,
            data,
            callback: Some(callback),
        }
    }

    /// Bare message with no payload (ok, ping, pong, screenshot...).
    pub fn bare(msg_type: MessageKind) -> Self {
        UdsMessage::new(msg_type, Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Typed views over message payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub session_type: String,
}

impl LoginRequest {
    pub fn null() -> Self {
        LoginRequest::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LoginResponse {
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub dead_line: Option<i64>,
    #[serde(default)]
    pub max_idle: Option<i64>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl LoginResponse {
    pub fn null() -> Self {
        LoginResponse::default()
    }

    pub fn logged_in(&self) -> bool {
        self.session_id.as_deref().is_some_and(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LogoutRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub session_type: String,
    #[serde(default)]
    pub session_id: String,
    /// Set when the logout originated on the public (broker facing) surface;
    /// such messages are forwarded to the user client untouched.
    #[serde(default)]
    pub from_broker: bool,
}

impl LogoutRequest {
    pub fn null(from_broker: bool) -> Self {
        LogoutRequest {
            from_broker,
            ..LogoutRequest::default()
        }
    }
}

/// Log levels on the broker's 10000-step scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum LogLevel {
    Other,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn value(self) -> i64 {
        match self {
            LogLevel::Other => 10_000,
            LogLevel::Debug => 20_000,
            LogLevel::Info => 30_000,
            LogLevel::Warning => 40_000,
            LogLevel::Error => 50_000,
            LogLevel::Critical => 60_000,
        }
    }
}

impl From<i64> for LogLevel {
    fn from(v: i64) -> Self {
        match v {
            i64::MIN..=19_999 => LogLevel::Other,
            20_000..=29_999 => LogLevel::Debug,
            30_000..=39_999 => LogLevel::Info,
            40_000..=49_999 => LogLevel::Warning,
            50_000..=59_999 => LogLevel::Error,
            _ => LogLevel::Critical,
        }
    }
}

impl From<LogLevel> for i64 {
    fn from(v: LogLevel) -> Self {
        v.value()
    }
}

impl From<log::Level> for LogLevel {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Trace | log::Level::Debug => LogLevel::Debug,
            log::Level::Info => LogLevel::Info,
            log::Level::Warn => LogLevel::Warning,
            log::Level::Error => LogLevel::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRequest {
    pub level: LogLevel,
    #[serde(default)]
    pub message: String,
}

/// Advance notice that a user is about to connect. Accepts both the current
/// schema (`username`) and the legacy one (`user`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PreconnectRequest {
    #[serde(default, alias = "user")]
    pub username: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub udsuser: String,
}

impl PreconnectRequest {
    pub fn null() -> Self {
        PreconnectRequest::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScriptRequest {
    #[serde(default)]
    pub script: String,
    /// When set, the script is forwarded to the user-space client instead of
    /// being executed by the service.
    #[serde(default)]
    pub as_user: bool,
}

/// What the CLI prints after a successful login: `ip,hostname,max_idle,deadline`.
pub fn login_result_line(r: &LoginResponse) -> String {
    format!(
        "{},{},{},{}",
        r.ip,
        r.hostname,
        r.max_idle.unwrap_or(0),
        r.dead_line.map(|d| d.to_string()).unwrap_or_default()
    )
}

impl Default for LogRequest {
    fn default() -> Self {
        LogRequest {
            level: LogLevel::Info,
            message: String::new(),
        }
    }
}

impl std::fmt::Display for InterfaceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{} / {}]", self.name, self.mac, self.ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preconnect_legacy_alias() {
        // 1. Legacy schema uses "user"
        let legacy: PreconnectRequest = serde_json::from_value(serde_json::json!({
            "user": "bob", "protocol": "rdp", "ip": "1.2.3.4", "hostname": "h", "udsuser": "u"
        }))
        .unwrap();

        // 2. Current schema uses "username"
        let current: PreconnectRequest = serde_json::from_value(serde_json::json!({
            "username": "bob", "protocol": "rdp", "ip": "1.2.3.4", "hostname": "h", "udsuser": "u"
        }))
        .unwrap();

        assert_eq!(legacy, current);
        assert_eq!(legacy.username, "bob");
    }

    #[test]
    fn test_certificate_alias() {
        let broker_form: CertificateInfo = serde_json::from_value(serde_json::json!({
            "private_key": "k", "server_certificate": "c", "password": "p", "ciphers": ""
        }))
        .unwrap();
        let short_form: CertificateInfo = serde_json::from_value(serde_json::json!({
            "key": "k", "certificate": "c", "password": "p", "ciphers": ""
        }))
        .unwrap();
        assert_eq!(broker_form, short_form);
    }

    #[test]
    fn test_configuration_defaults_roundtrip() {
        // Optional fields absent on the wire keep their defaults through a
        // serialize/deserialize cycle.
        let cfg: ActorConfiguration = serde_json::from_value(serde_json::json!({
            "host": "broker.example:443", "token": "T0"
        }))
        .unwrap();
        assert!(cfg.validate_certificate);
        assert_eq!(cfg.log_level, 2);
        assert!(!cfg.initialized);
        assert!(!cfg.is_null());

        let back: ActorConfiguration =
            serde_json::from_value(serde_json::to_value(&cfg).unwrap()).unwrap();
        assert_eq!(cfg, back);
    }

    #[test]
    fn test_null_configuration() {
        assert!(ActorConfiguration::default().is_null());

        let no_token = ActorConfiguration {
            host: "broker".into(),
            ..Default::default()
        };
        assert!(no_token.is_null());

        let no_host = ActorConfiguration {
            token: Some("T".into()),
            ..Default::default()
        };
        assert!(no_host.is_null());
    }

    #[test]
    fn test_message_wire_shape() {
        let msg = UdsMessage::new(
            MessageKind::Login,
            to_value(&LoginRequest {
                username: "alice".into(),
                session_type: "x11".into(),
            }),
        );
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire["msg_type"], "login");
        assert_eq!(wire["data"]["username"], "alice");
        // The reply channel never serializes
        assert!(wire.get("callback").is_none());
    }

    #[test]
    fn test_log_level_scale() {
        assert_eq!(serde_json::to_value(LogLevel::Info).unwrap(), 30_000);
        let lvl: LogLevel = serde_json::from_value(serde_json::json!(50_000)).unwrap();
        assert_eq!(lvl, LogLevel::Error);
        // Off-scale values bucket instead of failing
        let lvl: LogLevel = serde_json::from_value(serde_json::json!(42)).unwrap();
        assert_eq!(lvl, LogLevel::Other);
    }
}
