//! Linux implementation of the OS capability contract.
//!
//! Everything goes through sysfs, procfs or the usual admin commands
//! (`hostnamectl`, `realm`, `passwd`, `shutdown`); nothing here links
//! against X or systemd directly.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{ActorError, Result};
use crate::types::InterfaceInfo;
use crate::utils;

use super::ops::{hl_rename, JoinDomainConfig, Operations};

pub struct LinuxOperations;

impl LinuxOperations {
    pub fn new() -> Self {
        LinuxOperations
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| ActorError::Platform(format!("{program}: {e}")))?;
        if !output.status.success() {
            return Err(ActorError::Platform(format!(
                "{program} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for LinuxOperations {
    fn default() -> Self {
        LinuxOperations::new()
    }
}

fn mac_of(interface: &str) -> Option<String> {
    let raw = std::fs::read_to_string(format!("/sys/class/net/{interface}/address")).ok()?;
    let mac = raw.trim().to_uppercase();
    if mac.is_empty() {
        None
    } else {
        Some(mac)
    }
}

#[async_trait]
impl Operations for LinuxOperations {
    async fn is_admin(&self) -> Result<bool> {
        use std::os::unix::fs::MetadataExt;
        Ok(std::fs::metadata("/proc/self")?.uid() == 0)
    }

    async fn computer_name(&self) -> Result<String> {
        let name = hostname::get()
            .map_err(|e| ActorError::Platform(format!("hostname: {e}")))?
            .to_string_lossy()
            .into_owned();
        Ok(name.split('.').next().unwrap_or_default().to_string())
    }

    async fn list_interfaces(&self) -> Result<Vec<InterfaceInfo>> {
        let netifas = local_ip_address::list_afinet_netifas()
            .map_err(|e| ActorError::Platform(format!("interface listing: {e}")))?;

        let cards = netifas
            .into_iter()
            .filter(|(_, ip)| ip.is_ipv4())
            .filter_map(|(name, ip)| {
                mac_of(&name).map(|mac| InterfaceInfo {
                    name,
                    mac,
                    ip: ip.to_string(),
                })
            })
            .collect();

        // Source-level admission: no null MACs, no link-local addresses
        Ok(utils::filter_interfaces(cards, None))
    }

    async fn domain_name(&self) -> Result<String> {
        let full = hostname::get()
            .map_err(|e| ActorError::Platform(format!("hostname: {e}")))?
            .to_string_lossy()
            .into_owned();
        Ok(full.split_once('.').map(|(_, d)| d.to_string()).unwrap_or_default())
    }

    async fn os_name(&self) -> Result<String> {
        let release = std::fs::read_to_string("/etc/os-release").unwrap_or_default();
        Ok(release
            .lines()
            .find_map(|l| l.strip_prefix("ID="))
            .map(|v| v.trim_matches('"').to_string())
            .unwrap_or_else(|| crate::consts::UNKNOWN.to_string()))
    }

    async fn os_version(&self) -> Result<String> {
        Ok(format!("Linux {}", self.os_name().await?))
    }

    async fn reboot(&self, _flags: u32) -> Result<()> {
        if let Err(e) = self.run("/sbin/shutdown", &["now", "-r"]).await {
            log::error!("Error rebooting: {e}");
        }
        Ok(())
    }

    async fn logoff(&self) -> Result<()> {
        let user = std::env::var("USER").unwrap_or_default();
        if user.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.run("/usr/bin/pkill", &["-u", &user]).await {
            log::error!("Error killing user processes: {e}");
        }
        Ok(())
    }

    async fn rename_computer(&self, new_name: &str) -> Result<bool> {
        let old_name = self.computer_name().await?;
        self.run("hostnamectl", &["set-hostname", new_name]).await?;

        // Keep /etc/hosts coherent with the new name; failure here is not
        // worth aborting the rename for.
        if let Ok(hosts) = std::fs::read_to_string("/etc/hosts") {
            let rewritten: String = hosts
                .lines()
                .map(|line| {
                    let mapped: Vec<String> = line
                        .split_whitespace()
                        .map(|word| {
                            if word == old_name {
                                new_name.to_string()
                            } else {
                                word.to_string()
                            }
                        })
                        .collect();
                    mapped.join(" ")
                })
                .collect::<Vec<_>>()
                .join("\n");
            if let Err(e) = std::fs::write("/etc/hosts", rewritten + "\n") {
                log::warn!("Could not update /etc/hosts: {e}");
            }
        }

        // Reboot right away; slower than strictly needed but far more robust
        // with the variety of session managers out there.
        Ok(true)
    }

    async fn join_domain(&self, config: &JoinDomainConfig) -> Result<()> {
        if config.domain.is_empty() {
            return Err(ActorError::Platform(
                "error joining domain: no domain provided".into(),
            ));
        }

        if config.server_software == "ipa" {
            let hostname = format!(
                "{}.{}",
                self.computer_name().await?.to_lowercase(),
                config.domain
            );
            if let Err(e) = self.run("hostnamectl", &["set-hostname", &hostname]).await {
                log::error!("Error setting hostname for freeipa: {e}");
            }
        }

        let mut command: Vec<String> =
            vec!["join".into(), "-U".into(), config.account.clone()];
        if !config.client_software.is_empty() && config.client_software != "automatically" {
            command.push(format!("--client-software={}", config.client_software));
        }
        if !config.server_software.is_empty() {
            command.push(format!("--server-software={}", config.server_software));
        }
        if !config.membership_software.is_empty() && config.membership_software != "automatically" {
            command.push(format!("--membership-software={}", config.membership_software));
        }
        if !config.ou.is_empty() && config.server_software != "ipa" {
            command.push(format!("--computer-ou={}", config.ou));
        }
        if config.ssl {
            command.push("--use-ldaps".into());
        }
        if !config.automatic_id_mapping {
            command.push("--automatic-id-mapping=no".into());
        }
        command.push(config.domain.clone());

        let mut child = Command::new("realm")
            .args(&command)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ActorError::Platform(format!("realm: {e}")))?;
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(config.password.as_bytes()).await;
        }
        let status = child
            .wait()
            .await
            .map_err(|e| ActorError::Platform(format!("realm: {e}")))?;
        if !status.success() {
            return Err(ActorError::Platform(format!(
                "error joining machine to domain {}: realm exited with {status}",
                config.domain
            )));
        }
        Ok(())
    }

    async fn change_user_password(
        &self,
        user: &str,
        old_password: &str,
        new_password: &str,
    ) -> Result<()> {
        let mut child = Command::new("/usr/bin/passwd")
            .arg(user)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ActorError::Platform(format!("passwd: {e}")))?;
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin
                .write_all(format!("{old_password}\n{new_password}\n{new_password}\n").as_bytes())
                .await;
        }
        let status = child
            .wait()
            .await
            .map_err(|e| ActorError::Platform(format!("passwd: {e}")))?;
        if !status.success() {
            return Err(ActorError::Platform(format!(
                "passwd exited with {status} for user {user}"
            )));
        }
        Ok(())
    }

    async fn idle_duration(&self) -> Result<Duration> {
        // X sessions expose idle time through xprintidle; anywhere else
        // (Wayland, headless) zero is the safe monotonic answer.
        match self.run("xprintidle", &[]).await {
            Ok(out) => Ok(Duration::from_millis(out.trim().parse::<u64>().unwrap_or(0))),
            Err(_) => Ok(Duration::ZERO),
        }
    }

    async fn current_user(&self) -> Result<String> {
        std::env::var("USER")
            .or_else(|_| std::env::var("LOGNAME"))
            .map_err(|_| ActorError::Platform("no user in environment".into()))
    }

    async fn session_type(&self) -> Result<String> {
        if std::env::var_os("XRDP_SESSION").is_some() {
            return Ok("xrdp".into());
        }
        Ok(std::env::var("XDG_SESSION_TYPE").unwrap_or_else(|_| crate::consts::UNKNOWN.into()))
    }

    async fn force_time_sync(&self) -> Result<()> {
        Ok(())
    }

    async fn protect_file_owner_only(&self, path: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        Ok(())
    }

    fn set_process_title(&self, title: &str) {
        // comm is capped at 15 bytes by the kernel
        let short: String = title.chars().take(15).collect();
        let _ = std::fs::write("/proc/self/comm", short);
    }

    async fn hl_join_domain(
        &self,
        name: &str,
        custom: &serde_json::Map<String, Value>,
    ) -> Result<bool> {
        hl_rename(self, name, None, None, None).await?;
        self.join_domain(&JoinDomainConfig::from_custom(custom)).await?;
        Ok(true)
    }
}
