//! Protocol and runtime constants shared by every component of the actor.
//!
//! Values here are part of the wire contract with the UDS broker and the
//! user-space client; change them only together with the peers.

use std::path::PathBuf;
use std::sync::LazyLock;

use base64::Engine;
use rand::RngCore;

/// Actor version, reported to the broker and on the local REST surface.
pub const VERSION: &str = "4.0.0";
/// Full version string, used as index page body and `information` result.
pub const VERSION_FULL: &str = "UDSActor 4.0.0";
/// Build tag reported on `initialize`.
pub const BUILD: &str = "20240201";

/// Canonical "everything went fine" REST result.
pub const OK: &str = "ok";
/// Placeholder for values the platform could not determine.
pub const UNKNOWN: &str = "unknown";

/// Timeout for broker HTTPS calls, seconds.
pub const TIMEOUT: u64 = 5;
/// Delay between retries of lifecycle operations, seconds.
pub const WAIT_RETRY: u64 = 5;
/// Default retry budget for retryable broker endpoints.
pub const RETRIES: u32 = 3;
/// Initial delay of the exponential backoff used on retryable endpoints, seconds.
pub const RETRY_INITIAL_DELAY: u64 = 8;

/// Port the local secure server listens on.
pub const LISTEN_PORT: u16 = 43910;
/// Maximum accepted body size on the local server (128 KiB).
pub const CLIENT_MAX_SIZE: usize = 128 * 1024;
/// Grace window granted to tasks at teardown, seconds.
pub const TEARDOWN_GRACE: u64 = 5;

/// Version tag of the persisted configuration schema.
pub const CONFIG_VERSION: u32 = 0x40000;

/// Base path of the public (broker facing) REST surface.
pub const BASE_PUBLIC_REST_PATH: &str = "/actor";
/// Base path of the private (loopback only) REST surface.
pub const BASE_PRIVATE_REST_PATH: &str = "/private";

/// `Server:` header value stamped on every local REST response.
pub const SERVER_IDENTITY: &str = "UDSActor/4.0";

/// Minimum accepted TLS version, both as client and server.
pub const SECURE_MIN_TLS_VERSION: &str = "1.2";

/// Where the persisted actor configuration lives.
#[cfg(unix)]
pub fn config_file() -> PathBuf {
    if debug_mode() {
        PathBuf::from("udsactor.cfg")
    } else {
        PathBuf::from("/etc/udsactor/udsactor.cfg")
    }
}

#[cfg(windows)]
pub fn config_file() -> PathBuf {
    if debug_mode() {
        PathBuf::from("udsactor.cfg")
    } else {
        PathBuf::from(r"C:\ProgramData\UDSActor\udsactor.cfg")
    }
}

/// File where the CLI stores the session id between `login` and `logout`.
pub fn session_id_file() -> PathBuf {
    std::env::temp_dir().join("udsactor.session")
}

/// Debug features requested through the environment.
pub fn debug_mode() -> bool {
    matches!(
        std::env::var("UDS_DEBUG_ON").as_deref(),
        Ok("true") | Ok("yes") | Ok("1")
    )
}

/// Per-process capability token. It is the sole authenticator of the public
/// REST surface (embedded in the URL path by the broker) and is regenerated
/// on every start: 33 random bytes, URL-safe base64.
pub static OWN_AUTH_TOKEN: LazyLock<String> = LazyLock::new(|| {
    let mut raw = [0u8; 33];
    rand::rng().fill_bytes(&mut raw);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw)
});
