//! OS capability contract.
//!
//! One flat trait per concern, implemented once per target OS and chosen at
//! startup. Operations report failures in the platform category; nothing
//! OS-specific leaks past this boundary.
//!
//! The high level helpers (`hl_rename`, `list_valid_interfaces`) are free
//! functions over the contract, not trait methods: they hold the common
//! policy and only the primitives vary per OS.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::types::InterfaceInfo;
use crate::utils;

/// Domain join parameters, extracted from the broker's `os.custom` blob.
#[derive(Debug, Clone, Default)]
pub struct JoinDomainConfig {
    pub domain: String,
    pub ou: String,
    pub account: String,
    pub password: String,
    pub client_software: String,
    pub server_software: String,
    pub membership_software: String,
    pub ssl: bool,
    pub automatic_id_mapping: bool,
    /// Perform rename and join as a single operation (platforms that allow it).
    pub one_step: bool,
}

impl JoinDomainConfig {
    /// Reads the join parameters from the free-form custom map.
    pub fn from_custom(custom: &serde_json::Map<String, Value>) -> Self {
        let text = |key: &str| {
            custom
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let flag = |key: &str| custom.get(key).and_then(Value::as_bool).unwrap_or(false);
        JoinDomainConfig {
            domain: text("domain"),
            ou: text("ou"),
            account: text("account"),
            password: text("password"),
            client_software: text("client_software"),
            server_software: text("server_software"),
            membership_software: text("membership_software"),
            ssl: flag("ssl"),
            automatic_id_mapping: flag("automatic_id_mapping"),
            one_step: false,
        }
    }
}

/// OS level primitives required by the actor lifecycle.
#[async_trait]
pub trait Operations: Send + Sync {
    async fn is_admin(&self) -> Result<bool>;

    /// Computer name without the domain part.
    async fn computer_name(&self) -> Result<String>;

    /// Raw interface listing. Link-local and null-MAC entries are already
    /// dropped here; subnet restriction happens in `list_valid_interfaces`.
    async fn list_interfaces(&self) -> Result<Vec<InterfaceInfo>>;

    async fn domain_name(&self) -> Result<String>;

    async fn os_name(&self) -> Result<String>;

    async fn os_version(&self) -> Result<String>;

    async fn reboot(&self, flags: u32) -> Result<()>;

    async fn logoff(&self) -> Result<()>;

    /// Changes the computer name. Returns true when a reboot is required to
    /// activate it.
    async fn rename_computer(&self, new_name: &str) -> Result<bool>;

    async fn join_domain(&self, config: &JoinDomainConfig) -> Result<()>;

    async fn change_user_password(
        &self,
        user: &str,
        old_password: &str,
        new_password: &str,
    ) -> Result<()>;

    /// Time since last user input. Never negative; tick wrap is absorbed by
    /// the implementation.
    async fn idle_duration(&self) -> Result<Duration>;

    async fn current_user(&self) -> Result<String>;

    async fn session_type(&self) -> Result<String>;

    async fn force_time_sync(&self) -> Result<()>;

    /// Restricts a file so only its owner can read or write it.
    async fn protect_file_owner_only(&self, path: &Path) -> Result<()>;

    fn set_process_title(&self, title: &str);

    /// Rename-then-join with as few reboots as the platform allows. Returns
    /// true when a reboot is needed.
    async fn hl_join_domain(
        &self,
        name: &str,
        custom: &serde_json::Map<String, Value>,
    ) -> Result<bool>;
}

/// Renames the computer, optionally changing a user password first.
///
/// A failed password change is logged and ignored. When the hostname already
/// matches (case-insensitive) nothing happens and no reboot is requested;
/// otherwise the rename's own reboot requirement is reported.
pub async fn hl_rename(
    ops: &dyn Operations,
    name: &str,
    username: Option<&str>,
    old_password: Option<&str>,
    new_password: Option<&str>,
) -> Result<bool> {
    let hostname = ops.computer_name().await?;

    if let (Some(user), Some(new_password)) = (username, new_password) {
        log::info!("Setting password for configured user");
        if let Err(e) = ops
            .change_user_password(user, old_password.unwrap_or(""), new_password)
            .await
        {
            log::error!("Could not change password for user {user}: {e}");
        }
    }

    if hostname.eq_ignore_ascii_case(name) {
        log::info!("Computer name is already {hostname}");
        return Ok(false);
    }

    ops.rename_computer(name).await
}

/// Interface listing restricted to the configured service subnet.
pub async fn list_valid_interfaces(
    ops: &dyn Operations,
    restrict_net: Option<&str>,
) -> Result<Vec<InterfaceInfo>> {
    let cards = ops.list_interfaces().await?;
    Ok(utils::filter_interfaces(cards, restrict_net))
}


#[cfg(test)]
mod tests {
    use super::testing::FakeOperations;
    use super::*;

    #[tokio::test]
    async fn test_hl_rename_skips_when_name_matches() {
        let ops = FakeOperations {
            hostname: "PC-01".into(),
            ..Default::default()
        };
        // Case-insensitive match: nothing to do, no reboot
        let reboot = hl_rename(&ops, "pc-01", None, None, None).await.unwrap();
        assert!(!reboot);
        assert!(ops.recorded.lock().unwrap().renames.is_empty());
    }

    #[tokio::test]
    async fn test_hl_rename_renames_and_reports_reboot() {
        let ops = FakeOperations::default();
        let reboot = hl_rename(&ops, "PC-01", None, None, None).await.unwrap();
        assert!(reboot);
        assert_eq!(ops.recorded.lock().unwrap().renames, vec!["PC-01"]);
    }

    #[tokio::test]
    async fn test_hl_rename_password_change_failure_is_not_fatal() {
        let ops = FakeOperations {
            fail_password_change: true,
            ..Default::default()
        };
        let reboot = hl_rename(&ops, "PC-01", Some("user"), None, Some("pw"))
            .await
            .unwrap();
        // The rename still happens even though the password change failed
        assert!(reboot);
        assert_eq!(ops.recorded.lock().unwrap().renames, vec!["PC-01"]);
    }

    #[test]
    fn test_join_config_from_custom() {
        let custom: serde_json::Map<String, Value> = serde_json::from_value(serde_json::json!({
            "domain": "corp.example",
            "account": "joiner",
            "password": "pw",
            "ou": "ou=vdi",
            "ssl": true,
        }))
        .unwrap();
        let cfg = JoinDomainConfig::from_custom(&custom);
        assert_eq!(cfg.domain, "corp.example");
        assert_eq!(cfg.account, "joiner");
        assert!(cfg.ssl);
        assert!(!cfg.automatic_id_mapping);
        assert!(cfg.membership_software.is_empty());
    }
}
