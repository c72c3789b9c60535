//! Windows implementation of the OS capability contract.
//!
//! Operations are driven through PowerShell and the standard admin tools
//! (`shutdown`, `w32tm`, `net`, `icacls`); the interesting parts are domain
//! join (one-step rename+join when the name is changing) and idle time
//! (GetLastInputInfo through a small P/Invoke shim, tick wrap absorbed).

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::error::{ActorError, Result};
use crate::types::InterfaceInfo;
use crate::utils;

use super::ops::{JoinDomainConfig, Operations};

pub struct WindowsOperations;

impl WindowsOperations {
    pub fn new() -> Self {
        WindowsOperations
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

    async fn powershell(&self, script: &str) -> Result<String> {
        self.run(
            "powershell.exe",
            &["-NoProfile", "-NonInteractive", "-Command", script],
        )
        .await
    }
}

impl Default for WindowsOperations {
    fn default() -> Self {
        WindowsOperations::new()
    }
}

const IDLE_SCRIPT: &str = r#"
Add-Type @'
using System;
using System.Runtime.InteropServices;
public static class UserInput {
    [DllImport("user32.dll")]
    static extern bool GetLastInputInfo(ref LASTINPUTINFO plii);
    [StructLayout(LayoutKind.Sequential)]
    struct LASTINPUTINFO { public uint cbSize; public uint dwTime; }
    public static uint IdleMillis() {
        var info = new LASTINPUTINFO();
        info.cbSize = (uint)Marshal.SizeOf(info);
        GetLastInputInfo(ref info);
        return unchecked((uint)Environment.TickCount - info.dwTime);
    }
}
'@
[UserInput]::IdleMillis()
"#;

#[async_trait]
impl Operations for WindowsOperations {
    async fn is_admin(&self) -> Result<bool> {
        let out = self
            .powershell(
                "[Security.Principal.WindowsPrincipal]::new(\
                 [Security.Principal.WindowsIdentity]::GetCurrent()).IsInRole(\
                 [Security.Principal.WindowsBuiltInRole]::Administrator)",
            )
            .await?;
        Ok(out.trim().eq_ignore_ascii_case("true"))
    }

    async fn computer_name(&self) -> Result<String> {
        if let Ok(name) = std::env::var("COMPUTERNAME") {
            return Ok(name);
        }
        Ok(hostname::get()
            .map_err(|e| ActorError::Platform(format!("hostname: {e}")))?
            .to_string_lossy()
            .into_owned())
    }

    async fn list_interfaces(&self) -> Result<Vec<InterfaceInfo>> {
        let out = self
            .powershell(
                "Get-NetIPConfiguration | ForEach-Object { \
                 \"$($_.InterfaceAlias)|$($_.NetAdapter.MacAddress)|$($_.IPv4Address.IPAddress)\" }",
            )
            .await?;
        let cards = out
            .lines()
            .filter_map(|line| {
                let mut parts = line.trim().split('|');
                let name = parts.next()?.to_string();
                let mac = parts.next()?.replace('-', ":").to_uppercase();
                let ip = parts.next()?.to_string();
                Some(InterfaceInfo { name, mac, ip })
            })
            .collect();
        Ok(utils::filter_interfaces(cards, None))
    }

    async fn domain_name(&self) -> Result<String> {
        if let Ok(domain) = std::env::var("USERDNSDOMAIN") {
            return Ok(domain);
        }
        let out = self
            .powershell("(Get-CimInstance Win32_ComputerSystem).Domain")
            .await?;
        let domain = out.trim();
        // A workgroup machine reports WORKGROUP, which is not a domain
        if domain.eq_ignore_ascii_case("workgroup") {
            Ok(String::new())
        } else {
            Ok(domain.to_string())
        }
    }

    async fn os_name(&self) -> Result<String> {
        Ok("windows".into())
    }

    async fn os_version(&self) -> Result<String> {
        let out = self
            .powershell("(Get-CimInstance Win32_OperatingSystem).Caption")
            .await?;
        Ok(out.trim().to_string())
    }

    async fn reboot(&self, _flags: u32) -> Result<()> {
        if let Err(e) = self.run("shutdown.exe", &["/r", "/t", "0"]).await {
            log::error!("Error rebooting: {e}");
        }
        Ok(())
    }

    async fn logoff(&self) -> Result<()> {
        if let Err(e) = self.run("shutdown.exe", &["/l"]).await {
            log::error!("Error logging off: {e}");
        }
        Ok(())
    }

    async fn rename_computer(&self, new_name: &str) -> Result<bool> {
        self.powershell(&format!(
            "Rename-Computer -NewName '{new_name}' -Force"
        ))
        .await?;
        Ok(true)
    }

    async fn join_domain(&self, config: &JoinDomainConfig) -> Result<()> {
        if config.domain.is_empty() || config.account.is_empty() {
            return Err(ActorError::Platform(
                "domain, account and password are mandatory to join a domain".into(),
            ));
        }

        // Qualify the account with the domain when it is bare
        let account = if config.account.contains('@') || config.account.contains('\\') {
            config.account.clone()
        } else if config.domain.contains('.') {
            format!("{}@{}", config.account, config.domain)
        } else {
            format!("{}\\{}", config.domain, config.account)
        };

        let mut script = format!(
            "$pw = ConvertTo-SecureString '{password}' -AsPlainText -Force; \
             $cred = New-Object System.Management.Automation.PSCredential('{account}', $pw); \
             Add-Computer -DomainName '{domain}' -Credential $cred -Force",
            password = config.password.replace('\'', "''"),
            account = account.replace('\'', "''"),
            domain = config.domain,
        );
        if !config.ou.is_empty() {
            script.push_str(&format!(" -OUPath '{}'", config.ou.replace('\'', "''")));
        }
        if config.one_step {
            script.push_str(" -Options JoinWithNewName,AccountCreate");
        }
        self.powershell(&script).await?;
        Ok(())
    }

    async fn change_user_password(
        &self,
        user: &str,
        _old_password: &str,
        new_password: &str,
    ) -> Result<()> {
        self.run("net", &["user", user, new_password]).await?;
        Ok(())
    }

    async fn idle_duration(&self) -> Result<Duration> {
        let out = self.powershell(IDLE_SCRIPT).await?;
        Ok(Duration::from_millis(out.trim().parse::<u64>().unwrap_or(0)))
    }

    async fn current_user(&self) -> Result<String> {
        std::env::var("USERNAME")
            .map_err(|_| ActorError::Platform("no user in environment".into()))
    }

    async fn session_type(&self) -> Result<String> {
        Ok(std::env::var("SESSIONNAME").unwrap_or_else(|_| crate::consts::UNKNOWN.into()))
    }

    async fn force_time_sync(&self) -> Result<()> {
        if let Err(e) = self.run("w32tm", &["/resync"]).await {
            log::warn!("Time sync failed: {e}");
        }
        Ok(())
    }

    async fn protect_file_owner_only(&self, path: &Path) -> Result<()> {
        let path = path.as_os_str().to_string_lossy().into_owned();
        self.run(
            "icacls",
            &[
                path.as_ref(),
                "/inheritance:r",
                "/grant:r",
                "*S-1-5-18:F",
                "/grant:r",
                "*S-1-5-32-544:F",
            ],
        )
        .await?;
        Ok(())
    }

    fn set_process_title(&self, _title: &str) {
        // No portable equivalent worth a console title flicker
    }

    /// Rename-then-join with the fewest reboots: when the name is changing,
    /// the join carries the new name in a single step; when it is not, only
    /// the missing join runs.
    async fn hl_join_domain(
        &self,
        name: &str,
        custom: &serde_json::Map<String, Value>,
    ) -> Result<bool> {
        let mut config = JoinDomainConfig::from_custom(custom);
        let current = self.computer_name().await?;

        if current.eq_ignore_ascii_case(name) {
            if !self.domain_name().await?.is_empty() {
                log::debug!("Machine {name} is already part of domain {}", config.domain);
                return Ok(false);
            }
            self.join_domain(&config).await?;
            return Ok(true);
        }

        self.rename_computer(name).await?;
        config.one_step = true;
        self.join_domain(&config).await?;
        Ok(true)
    }
}
