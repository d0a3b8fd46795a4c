//! Configuration for a bisection run: the `[bisect]` knobs, the `[[hosts]]`
//! list, and the `[console]` collector chain, loaded from a TOML document.
//!
//! Loading normalizes the document (trims strings, clamps zeroed timeouts
//! back to defaults) and rejects layouts it cannot interpret unambiguously —
//! notably the legacy single-host `[slave]` table.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use kbisect_core::TestMode;

pub const ENV_KBISECT_CONFIG: &str = "KBISECT_CONFIG";

const DEFAULT_CONFIG_FILE: &str = "kbisect.toml";
const DEFAULT_DB_PATH: &str = "kbisect.db";
const DEFAULT_SSH_USER: &str = "root";
const DEFAULT_KERNEL_PATH: &str = "/root/kernel";
const DEFAULT_LIBRARY_PATH: &str = "/root/kernel-bisect/lib";
const DEFAULT_BUILD_TIMEOUT_SECS: u64 = 1800;
const DEFAULT_BOOT_TIMEOUT_SECS: u64 = 300;
const DEFAULT_TEST_TIMEOUT_SECS: u64 = 600;
const DEFAULT_SSH_CONNECT_TIMEOUT_SECS: u64 = 15;
const DEFAULT_RECOVERY_ATTEMPTS: u32 = 3;
const DEFAULT_RECOVERY_DELAY_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Message(String),
}

impl ConfigError {
    fn invalid(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

/// Power control variant selected per host. `ShellReboot` is the null
/// variant: reboot over the remote shell, no out-of-band recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerControlSelection {
    Ipmi,
    LabAutomation,
    ShellReboot,
}

impl Default for PowerControlSelection {
    fn default() -> Self {
        Self::ShellReboot
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    pub hostname: String,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default = "default_kernel_path")]
    pub kernel_path: String,
    #[serde(default = "default_library_path")]
    pub library_path: String,
    #[serde(default)]
    pub test_script: Option<String>,
    #[serde(default)]
    pub base_config: Option<String>,
    #[serde(default)]
    pub power_control: PowerControlSelection,
    #[serde(default)]
    pub ipmi_host: Option<String>,
    #[serde(default)]
    pub ipmi_user: Option<String>,
    #[serde(default)]
    pub ipmi_password: Option<String>,
}

impl HostConfig {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ssh_user: default_ssh_user(),
            kernel_path: default_kernel_path(),
            library_path: default_library_path(),
            test_script: None,
            base_config: None,
            power_control: PowerControlSelection::default(),
            ipmi_host: None,
            ipmi_user: None,
            ipmi_password: None,
        }
    }

    /// The on-host shell library entry point.
    pub fn library_file(&self) -> String {
        format!("{}/bisect-functions.sh", self.library_path)
    }

    /// Copy of this host config with credentials blanked, safe to freeze
    /// into the session snapshot.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.ipmi_password.is_some() {
            copy.ipmi_password = Some("<redacted>".to_owned());
        }
        copy
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BisectSettings {
    #[serde(default = "default_test_type")]
    pub test_type: String,
    #[serde(default = "default_build_timeout_secs")]
    pub build_timeout_secs: u64,
    #[serde(default = "default_boot_timeout_secs")]
    pub boot_timeout_secs: u64,
    #[serde(default = "default_test_timeout_secs")]
    pub test_timeout_secs: u64,
    #[serde(default = "default_ssh_connect_timeout_secs")]
    pub ssh_connect_timeout_secs: u64,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_recovery_attempts")]
    pub recovery_attempts: u32,
    #[serde(default = "default_recovery_delay_secs")]
    pub recovery_delay_secs: u64,
    #[serde(default = "default_true")]
    pub collect_baseline: bool,
    #[serde(default = "default_true")]
    pub collect_per_iteration: bool,
    #[serde(default)]
    pub collect_console_logs: bool,
    #[serde(default)]
    pub cleanup_keep_kernels: u32,
}

impl Default for BisectSettings {
    fn default() -> Self {
        Self {
            test_type: default_test_type(),
            build_timeout_secs: default_build_timeout_secs(),
            boot_timeout_secs: default_boot_timeout_secs(),
            test_timeout_secs: default_test_timeout_secs(),
            ssh_connect_timeout_secs: default_ssh_connect_timeout_secs(),
            db_path: default_db_path(),
            recovery_attempts: default_recovery_attempts(),
            recovery_delay_secs: default_recovery_delay_secs(),
            collect_baseline: true,
            collect_per_iteration: true,
            collect_console_logs: false,
            cleanup_keep_kernels: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConsoleSettings {
    #[serde(default)]
    pub collectors: Vec<String>,
    #[serde(default)]
    pub hostname_override: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BisectConfig {
    #[serde(default)]
    pub bisect: BisectSettings,
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
    #[serde(default)]
    pub console: ConsoleSettings,
}

impl BisectConfig {
    pub fn test_mode(&self) -> TestMode {
        if self.bisect.test_type == "custom" {
            TestMode::Custom
        } else {
            TestMode::Boot
        }
    }

    /// JSON snapshot frozen into the session row. Credentials are redacted;
    /// the snapshot records inputs, never secrets.
    pub fn snapshot_json(&self) -> Result<serde_json::Value, ConfigError> {
        let mut copy = self.clone();
        copy.hosts = copy.hosts.iter().map(HostConfig::redacted).collect();
        serde_json::to_value(&copy)
            .map_err(|err| ConfigError::invalid(format!("failed to serialize config: {err}")))
    }
}

fn default_ssh_user() -> String {
    DEFAULT_SSH_USER.to_owned()
}

fn default_kernel_path() -> String {
    DEFAULT_KERNEL_PATH.to_owned()
}

fn default_library_path() -> String {
    DEFAULT_LIBRARY_PATH.to_owned()
}

fn default_test_type() -> String {
    "boot".to_owned()
}

fn default_db_path() -> String {
    DEFAULT_DB_PATH.to_owned()
}

fn default_build_timeout_secs() -> u64 {
    DEFAULT_BUILD_TIMEOUT_SECS
}

fn default_boot_timeout_secs() -> u64 {
    DEFAULT_BOOT_TIMEOUT_SECS
}

fn default_test_timeout_secs() -> u64 {
    DEFAULT_TEST_TIMEOUT_SECS
}

fn default_ssh_connect_timeout_secs() -> u64 {
    DEFAULT_SSH_CONNECT_TIMEOUT_SECS
}

fn default_recovery_attempts() -> u32 {
    DEFAULT_RECOVERY_ATTEMPTS
}

fn default_recovery_delay_secs() -> u64 {
    DEFAULT_RECOVERY_DELAY_SECS
}

fn default_true() -> bool {
    true
}

pub fn config_path_from_env() -> PathBuf {
    match std::env::var(ENV_KBISECT_CONFIG) {
        Ok(raw) if !raw.trim().is_empty() => PathBuf::from(raw),
        _ => PathBuf::from(DEFAULT_CONFIG_FILE),
    }
}

pub fn load_from_env() -> Result<BisectConfig, ConfigError> {
    load_from_path(config_path_from_env())
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<BisectConfig, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|err| {
        ConfigError::invalid(format!("failed to read {}: {err}", path.display()))
    })?;
    load_from_str(&raw)
}

pub fn load_from_str(raw: &str) -> Result<BisectConfig, ConfigError> {
    let document: toml::Value = toml::from_str(raw)
        .map_err(|err| ConfigError::invalid(format!("failed to parse config: {err}")))?;

    if let Some(table) = document.as_table() {
        if table.contains_key("slave") {
            return Err(ConfigError::invalid(
                "legacy single-host `[slave]` configuration is not supported; \
                 move the host into a `[[hosts]]` entry",
            ));
        }
    }

    let mut config: BisectConfig = document
        .try_into()
        .map_err(|err| ConfigError::invalid(format!("failed to parse config: {err}")))?;

    normalize_config(&mut config)?;
    Ok(config)
}

fn normalize_config(config: &mut BisectConfig) -> Result<(), ConfigError> {
    if config.hosts.is_empty() {
        return Err(ConfigError::invalid(
            "no hosts configured; at least one `[[hosts]]` entry is required",
        ));
    }

    match config.bisect.test_type.trim() {
        "boot" | "custom" => config.bisect.test_type = config.bisect.test_type.trim().to_owned(),
        other => {
            return Err(ConfigError::invalid(format!(
                "invalid test_type '{other}': expected 'boot' or 'custom'"
            )))
        }
    }

    if config.bisect.build_timeout_secs == 0 {
        config.bisect.build_timeout_secs = DEFAULT_BUILD_TIMEOUT_SECS;
    }
    if config.bisect.boot_timeout_secs == 0 {
        config.bisect.boot_timeout_secs = DEFAULT_BOOT_TIMEOUT_SECS;
    }
    if config.bisect.test_timeout_secs == 0 {
        config.bisect.test_timeout_secs = DEFAULT_TEST_TIMEOUT_SECS;
    }
    if config.bisect.ssh_connect_timeout_secs == 0 {
        config.bisect.ssh_connect_timeout_secs = DEFAULT_SSH_CONNECT_TIMEOUT_SECS;
    }
    if config.bisect.recovery_attempts == 0 {
        config.bisect.recovery_attempts = DEFAULT_RECOVERY_ATTEMPTS;
    }
    if config.bisect.db_path.trim().is_empty() {
        config.bisect.db_path = default_db_path();
    }

    let mut seen = std::collections::HashSet::new();
    for host in &mut config.hosts {
        host.hostname = host.hostname.trim().to_owned();
        if host.hostname.is_empty() {
            return Err(ConfigError::invalid("host entry with empty hostname"));
        }
        if !seen.insert(host.hostname.clone()) {
            return Err(ConfigError::invalid(format!(
                "duplicate host '{}'",
                host.hostname
            )));
        }
        if host.ssh_user.trim().is_empty() {
            host.ssh_user = default_ssh_user();
        }
        if host.kernel_path.trim().is_empty() {
            host.kernel_path = default_kernel_path();
        }
        if host.library_path.trim().is_empty() {
            host.library_path = default_library_path();
        }

        if host.power_control == PowerControlSelection::Ipmi {
            let complete = host.ipmi_host.as_deref().is_some_and(|v| !v.trim().is_empty())
                && host.ipmi_user.is_some()
                && host.ipmi_password.is_some();
            if !complete {
                return Err(ConfigError::invalid(format!(
                    "host '{}' selects ipmi power control but is missing \
                     ipmi_host/ipmi_user/ipmi_password",
                    host.hostname
                )));
            }
        }
    }

    if config.bisect.test_type == "custom" {
        for host in &config.hosts {
            if host.test_script.as_deref().map_or(true, |s| s.trim().is_empty()) {
                return Err(ConfigError::invalid(format!(
                    "test_type is 'custom' but host '{}' has no test_script",
                    host.hostname
                )));
            }
        }
    }

    for collector in &config.console.collectors {
        match collector.as_str() {
            "conserver" | "ipmi_sol" => {}
            other => {
                return Err(ConfigError::invalid(format!(
                    "unknown console collector '{other}': expected 'conserver' or 'ipmi_sol'"
                )))
            }
        }
    }

    Ok(())
}

/// Commented sample configuration written by `kbisect init-config`.
pub fn sample_config() -> &'static str {
    r#"# kbisect configuration

[bisect]
test_type = "boot"              # "boot" = does the kernel boot; "custom" = per-host script
build_timeout_secs = 1800
boot_timeout_secs = 300
test_timeout_secs = 600
ssh_connect_timeout_secs = 15
db_path = "kbisect.db"
recovery_attempts = 3
recovery_delay_secs = 30
collect_baseline = true
collect_per_iteration = true
collect_console_logs = false
cleanup_keep_kernels = 0        # 0 disables post-iteration kernel cleanup

[[hosts]]
hostname = "testbox.example.com"
ssh_user = "root"
kernel_path = "/root/kernel"
library_path = "/root/kernel-bisect/lib"
# test_script = "/path/to/test.sh"     # required when test_type = "custom"
# base_config = "/path/to/.config"
power_control = "shell_reboot"         # "ipmi" | "lab_automation" | "shell_reboot"
# ipmi_host = "testbox-bmc.example.com"
# ipmi_user = "admin"
# ipmi_password = "secret"

[console]
collectors = []                  # tried in order: "conserver", "ipmi_sol"
# hostname_override = "testbox-console.example.com"
"#
}
