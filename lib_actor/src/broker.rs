//! # Broker REST client
//!
//! Typed facade over the UDS broker HTTPS API (`https://{host}/uds/rest/`)
//! plus the loopback client the CLI uses against the actor's own private
//! surface.
//!
//! Every broker call runs over the restricted TLS profile from
//! [`crate::security`], carries `Content-Type: application/json` and a
//! `User-Agent` with the actor version, and unwraps the common
//! `{result, stamp, version, error?}` envelope. The endpoints the lifecycle
//! depends on for serving (`ready`, `ipchange`, `login`, `logout`) retry on
//! connection errors with exponential backoff; everything else fails fast.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{json, Value};

use crate::consts;
use crate::error::{ActorError, Result};
use crate::security;
use crate::types::{
    ActorKind, Authenticator, CertificateInfo, InitializationResult, InterfaceInfo, LogLevel,
    LoginResponse, OsAction, OsConfiguration,
};
use crate::utils;

/// Which half of the broker API a method belongs to.
#[derive(Debug, Clone, Copy)]
enum ApiKind {
    Auth,
    ActorV3,
}

/// The broker operations the actor lifecycle depends on. A contract rather
/// than a concrete type so lifecycles can be exercised against an in-memory
/// broker.
#[async_trait]
pub trait BrokerApi: Send + Sync {
    /// Exchanges the stored token for a machine-bound one plus the OS action.
    async fn initialize(
        &self,
        interfaces: &[InterfaceInfo],
        kind: ActorKind,
    ) -> Result<InitializationResult>;

    /// Unmanaged equivalent of `ready`: registers the listening port and
    /// obtains the serving certificate without binding the machine.
    async fn unmanaged_ready(
        &self,
        interfaces: &[InterfaceInfo],
        port: u16,
    ) -> Result<CertificateInfo>;

    /// Announces `ip:port`, receives the serving certificate.
    async fn ready(&self, ip: &str, port: u16) -> Result<CertificateInfo>;

    /// Rotates the certificate after an IP change.
    async fn notify_ip_change(&self, ip: &str, port: u16) -> Result<CertificateInfo>;

    /// Notifies a user session start.
    async fn notify_login(
        &self,
        kind: ActorKind,
        username: &str,
        session_type: &str,
    ) -> Result<LoginResponse>;

    /// Notifies a user session end. The broker answers "ok" or "notified".
    async fn notify_logout(
        &self,
        kind: ActorKind,
        username: &str,
        session_type: &str,
        session_id: &str,
    ) -> Result<Option<String>>;

    /// Ships one log record to the broker.
    async fn log(&self, level: LogLevel, message: &str) -> Result<()>;

    /// Checks whether the stored token is still accepted.
    async fn test(&self, kind: ActorKind) -> Result<bool>;

    /// Replaces the bearer token used from now on.
    fn set_token(&self, token: Option<String>);
}

/// HTTPS client for the broker REST contract.
pub struct BrokerClient {
    client: reqwest::Client,
    base_url: String,
    host: String,
    token: RwLock<Option<String>>,
}

impl BrokerClient {
    pub fn new(host: &str, verify_certificate: bool, token: Option<String>) -> Result<Self> {
        let tls = security::client_tls_config(verify_certificate)?;
        let client = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .timeout(Duration::from_secs(consts::TIMEOUT))
            .user_agent(format!("UDS AppServer v{}", consts::VERSION))
            .build()
            .map_err(|e| ActorError::Config(format!("HTTP client: {e}")))?;

        Ok(BrokerClient {
            client,
            base_url: format!("https://{host}/uds/rest/"),
            host: host.to_string(),
            token: RwLock::new(token),
        })
    }

    fn token(&self) -> Result<String> {
        self.token
            .read()
            .ok()
            .and_then(|t| t.clone())
            .ok_or_else(|| ActorError::Broker("token not provided".into()))
    }

    fn url_for(&self, api: ApiKind, method: &str) -> String {
        match api {
            ApiKind::Auth => format!("{}auth/{method}", self.base_url),
            ApiKind::ActorV3 => format!("{}actor/v3/{method}", self.base_url),
        }
    }

    /// POST core: sends JSON, unwraps the envelope, maps transport and
    /// broker-reported failures to their categories.
    async fn do_post(
        &self,
        api: ApiKind,
        method: &str,
        payload: &Value,
        headers: Option<HeaderMap>,
        return_raw: bool,
    ) -> Result<Value> {
        let mut request = self.client.post(self.url_for(api, method)).json(payload);
        if let Some(h) = headers {
            request = request.headers(h);
        }
        let response = request.send().await.map_err(connection_or_broker)?;
        self.unwrap_envelope(response, return_raw).await
    }

    async fn do_get(&self, api: ApiKind, method: &str, return_raw: bool) -> Result<Value> {
        let response = self
            .client
            .get(self.url_for(api, method))
            .send()
            .await
            .map_err(connection_or_broker)?;
        self.unwrap_envelope(response, return_raw).await
    }

    async fn unwrap_envelope(&self, response: reqwest::Response, return_raw: bool) -> Result<Value> {
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ActorError::Broker(format!(
                "{} answered {status}: {body}",
                self.host
            )));
        }
        let envelope: Value = response.json().await.map_err(connection_or_broker)?;
        if let Some(error) = envelope.get("error").filter(|e| !e.is_null()) {
            return Err(classify_broker_error(error));
        }
        if return_raw {
            return Ok(envelope);
        }
        envelope
            .get("result")
            .cloned()
            .ok_or_else(|| ActorError::Broker("envelope without result".into()))
    }

    // -- Registration-time surface (consumed by the register tooling) -------

    /// Lists the login realms, sorted by display name.
    pub async fn enumerate_authenticators(&self) -> Result<Vec<Authenticator>> {
        let raw = self.do_get(ApiKind::Auth, "auths", true).await?;
        let mut auths: Vec<Authenticator> = serde_json::from_value(raw)?;
        auths.sort_by(|a, b| a.auth.to_lowercase().cmp(&b.auth.to_lowercase()));
        Ok(auths)
    }

    /// Exchanges user credentials for the session token header used by
    /// `register`.
    pub async fn auth_login(
        &self,
        auth: &str,
        username: &str,
        password: &str,
    ) -> Result<HeaderMap> {
        let raw = self
            .do_post(
                ApiKind::Auth,
                "login",
                &json!({"auth": auth, "username": username, "password": password}),
                None,
                true,
            )
            .await
            .map_err(|_| ActorError::InvalidKey)?;
        let token = raw
            .get("token")
            .and_then(Value::as_str)
            .ok_or(ActorError::InvalidKey)?;
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-Auth-Token",
            HeaderValue::from_str(token).map_err(|_| ActorError::InvalidKey)?,
        );
        Ok(headers)
    }

    /// One-shot install-time registration; returns the long-lived token.
    #[allow(clippy::too_many_arguments)]
    pub async fn register(
        &self,
        auth: &str,
        username: &str,
        password: &str,
        hostname: &str,
        ip: &str,
        mac: &str,
        pre_command: &str,
        runonce_command: &str,
        post_command: &str,
        log_level: i32,
    ) -> Result<String> {
        let payload = json!({
            "username": format!("{username}@{auth}"),
            "hostname": hostname,
            "ip": ip,
            "mac": mac,
            "pre_command": pre_command,
            "run_once_command": runonce_command,
            "post_command": post_command,
            // Registration keeps the historical level encoding
            "log_level": (log_level * 10_000) + 20_000,
        });
        let headers = self.auth_login(auth, username, password).await?;
        let result = self
            .do_post(ApiKind::ActorV3, "register", &payload, Some(headers), false)
            .await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ActorError::Broker("register returned no token".into()))
    }
}

#[async_trait]
impl BrokerApi for BrokerClient {
    async fn initialize(
        &self,
        interfaces: &[InterfaceInfo],
        kind: ActorKind,
    ) -> Result<InitializationResult> {
        let payload = json!({
            "type": kind.to_string(),
            "token": self.token()?,
            "version": consts::VERSION,
            "build": consts::BUILD,
            "id": id_list(interfaces),
        });
        let result = self
            .do_post(ApiKind::ActorV3, "initialize", &payload, None, false)
            .await?;
        Ok(parse_initialization(&result))
    }

    async fn unmanaged_ready(
        &self,
        interfaces: &[InterfaceInfo],
        port: u16,
    ) -> Result<CertificateInfo> {
        let payload = json!({
            "id": id_list(interfaces),
            "token": self.token()?,
            "secret": consts::OWN_AUTH_TOKEN.as_str(),
            "port": port,
        });
        let result = self
            .do_post(ApiKind::ActorV3, "unmanaged", &payload, None, false)
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn ready(&self, ip: &str, port: u16) -> Result<CertificateInfo> {
        let payload = json!({
            "token": self.token()?,
            "secret": consts::OWN_AUTH_TOKEN.as_str(),
            "ip": ip,
            "port": port,
        });
        let result = self
            .retry_post(ApiKind::ActorV3, "ready", payload)
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn notify_ip_change(&self, ip: &str, port: u16) -> Result<CertificateInfo> {
        let payload = json!({
            "token": self.token()?,
            "secret": consts::OWN_AUTH_TOKEN.as_str(),
            "ip": ip,
            "port": port,
        });
        let result = self
            .retry_post(ApiKind::ActorV3, "ipchange", payload)
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn notify_login(
        &self,
        kind: ActorKind,
        username: &str,
        session_type: &str,
    ) -> Result<LoginResponse> {
        let payload = json!({
            "type": kind.to_string(),
            "token": self.token()?,
            "username": username,
            "session_type": session_type,
        });
        let result = self.retry_post(ApiKind::ActorV3, "login", payload).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn notify_logout(
        &self,
        kind: ActorKind,
        username: &str,
        session_type: &str,
        session_id: &str,
    ) -> Result<Option<String>> {
        let payload = json!({
            "type": kind.to_string(),
            "token": self.token()?,
            "username": username,
            "session_type": session_type,
            "session_id": session_id,
        });
        let result = self.retry_post(ApiKind::ActorV3, "logout", payload).await?;
        Ok(result.as_str().map(str::to_string))
    }

    async fn log(&self, level: LogLevel, message: &str) -> Result<()> {
        let payload = json!({
            "token": self.token()?,
            "level": level.value(),
            "message": message,
        });
        self.do_post(ApiKind::ActorV3, "log", &payload, None, false)
            .await?;
        Ok(())
    }

    async fn test(&self, kind: ActorKind) -> Result<bool> {
        let payload = json!({"token": self.token()?, "type": kind.to_string()});
        let result = self
            .do_post(ApiKind::ActorV3, "test", &payload, None, false)
            .await?;
        Ok(result.as_str() == Some(consts::OK))
    }

    fn set_token(&self, token: Option<String>) {
        if let Ok(mut guard) = self.token.write() {
            *guard = token;
        }
    }
}

impl BrokerClient {
    async fn retry_post(&self, api: ApiKind, method: &'static str, payload: Value) -> Result<Value> {
        let payload = &payload;
        utils::retry_connection(
            consts::RETRIES,
            Duration::from_secs(consts::RETRY_INITIAL_DELAY),
            move || async move { self.do_post(api, method, payload, None, false).await },
        )
        .await
    }
}

fn id_list(interfaces: &[InterfaceInfo]) -> Value {
    Value::Array(
        interfaces
            .iter()
            .map(|i| json!({"mac": i.mac, "ip": i.ip}))
            .collect(),
    )
}

fn connection_or_broker(e: reqwest::Error) -> ActorError {
    ActorError::from(e)
}

/// The broker reports failures as free text; two of them carry meaning the
/// lifecycle reacts to.
fn classify_broker_error(error: &Value) -> ActorError {
    let text = match error {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let lowered = text.to_lowercase();
    if lowered.contains("unmanaged") {
        ActorError::Unmanaged
    } else if lowered.contains("invalid token") || lowered.contains("invalid key") {
        ActorError::InvalidKey
    } else {
        ActorError::Broker(text)
    }
}

/// Decodes the `initialize` result, folding the legacy top-level OS fields
/// (`username`, `password`, `new_password`, `ad`, `ou`) into `os.custom`
/// (`ad` becomes `domain`) before anything uses them.
fn parse_initialization(result: &Value) -> InitializationResult {
    let token = result
        .get("token")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string);
    let unique_id = result
        .get("unique_id")
        .and_then(Value::as_str)
        .filter(|u| !u.is_empty())
        .map(str::to_lowercase);

    let os = result.get("os").filter(|o| o.is_object()).map(|os| {
        let mut custom = os
            .get("custom")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        for legacy in ["username", "password", "new_password", "ad", "ou"] {
            if let Some(value) = os.get(legacy) {
                let name = if legacy == "ad" { "domain" } else { legacy };
                custom.insert(name.to_string(), value.clone());
            }
        }
        OsConfiguration {
            action: match os.get("action").and_then(Value::as_str) {
                Some("rename") => OsAction::Rename,
                Some("rename_ad") => OsAction::RenameAd,
                _ => OsAction::None,
            },
            name: os
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            custom: if custom.is_empty() { None } else { Some(custom) },
        }
    });

    InitializationResult {
        token,
        unique_id,
        os,
    }
}

// ---------------------------------------------------------------------------
// Loopback client (CLI side of the private surface)
// ---------------------------------------------------------------------------

/// Client for the actor's own private REST surface. Loopback only, so the
/// certificate is never verified; TLS 1.3 is enforced instead.
pub struct PrivateClient {
    client: reqwest::Client,
    base_url: String,
}

impl PrivateClient {
    pub fn new(ipv6: bool) -> Result<Self> {
        let host = if ipv6 { "[::1]" } else { "127.0.0.1" };
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .min_tls_version(reqwest::tls::Version::TLS_1_3)
            .timeout(Duration::from_secs(consts::TIMEOUT))
            .user_agent(format!("UDS Actor Client v{}", consts::VERSION))
            .build()
            .map_err(|e| ActorError::Config(format!("HTTP client: {e}")))?;
        Ok(PrivateClient {
            client,
            base_url: format!(
                "https://{host}:{}{}/",
                consts::LISTEN_PORT,
                consts::BASE_PRIVATE_REST_PATH
            ),
        })
    }

    async fn do_post(&self, method: &str, payload: &Value) -> Result<Value> {
        let response = self
            .client
            .post(format!("{}{method}", self.base_url))
            .json(payload)
            .send()
            .await
            .map_err(connection_or_broker)?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ActorError::Broker(format!("actor answered {status}: {body}")));
        }
        Ok(response.json().await.map_err(connection_or_broker)?)
    }

    pub async fn user_login(&self, username: &str, session_type: &str) -> Result<LoginResponse> {
        let result = self
            .do_post(
                "user_login",
                &json!({"username": username, "session_type": session_type}),
            )
            .await?;
        serde_json::from_value(result)
            .map_err(|_| ActorError::Broker("invalid ticket received from UDS broker".into()))
    }

    pub async fn user_logout(
        &self,
        username: &str,
        session_type: &str,
        session_id: &str,
    ) -> Result<()> {
        self.do_post(
            "user_logout",
            &json!({
                "username": username,
                "session_type": session_type,
                "session_id": session_id,
            }),
        )
        .await?;
        Ok(())
    }

    pub async fn log(&self, level: LogLevel, message: &str) -> Result<()> {
        self.do_post(
            "log",
            &json!({"level": level.value(), "message": message}),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_legacy_folding() {
        // Legacy brokers put credentials at the os top level; they must land
        // in custom with "ad" renamed to "domain".
        let result = json!({
            "token": "T1",
            "unique_id": "00:11:22:33:44:55",
            "os": {
                "action": "rename_ad",
                "name": "PC-01",
                "username": "joiner",
                "password": "secret",
                "ad": "corp.example",
                "ou": "ou=vdi,dc=corp",
            }
        });
        let parsed = parse_initialization(&result);
        assert_eq!(parsed.token.as_deref(), Some("T1"));
        assert_eq!(parsed.unique_id.as_deref(), Some("00:11:22:33:44:55"));

        let os = parsed.os.unwrap();
        assert_eq!(os.action, OsAction::RenameAd);
        assert_eq!(os.name, "PC-01");
        let custom = os.custom.unwrap();
        assert_eq!(custom["domain"], "corp.example");
        assert_eq!(custom["username"], "joiner");
        assert!(!custom.contains_key("ad"));
    }

    #[test]
    fn test_initialize_modern_payload() {
        let result = json!({
            "token": "T1",
            "unique_id": "AA:BB:CC:DD:EE:FF",
            "os": {"action": "rename", "name": "pc", "custom": {"udsdone": true}}
        });
        let parsed = parse_initialization(&result);
        // unique_id is normalized to lowercase for MAC matching
        assert_eq!(parsed.unique_id.as_deref(), Some("aa:bb:cc:dd:ee:ff"));
        let os = parsed.os.unwrap();
        assert_eq!(os.action, OsAction::Rename);
        assert_eq!(os.custom.unwrap()["udsdone"], true);
    }

    #[test]
    fn test_initialize_without_os() {
        let parsed = parse_initialization(&json!({"token": "T", "unique_id": null, "os": null}));
        assert!(parsed.os.is_none());
        assert!(parsed.unique_id.is_none());
    }

    #[test]
    fn test_broker_error_classification() {
        assert!(matches!(
            classify_broker_error(&json!("Invalid token received")),
            ActorError::InvalidKey
        ));
        assert!(matches!(
            classify_broker_error(&json!("Machine is an Unmanaged host")),
            ActorError::Unmanaged
        ));
        assert!(matches!(
            classify_broker_error(&json!("something else")),
            ActorError::Broker(_)
        ));
    }
}
