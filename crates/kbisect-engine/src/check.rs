use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use kbisect_config::{BisectConfig, PowerControlSelection};
use kbisect_power::PowerController;
use kbisect_remote::{shell_quote, RemoteExec};

use crate::compose::{build_remote, power_settings};

const CHECK_OP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

impl CheckResult {
    fn pass(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Pass,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn fail(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Fail,
            detail: detail.into(),
        }
    }
}

fn find_in_path(tool: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(tool);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

fn tool_check(tool: &str, required_by: &str) -> CheckResult {
    match find_in_path(tool) {
        Some(path) => CheckResult::pass(
            format!("tool:{tool}"),
            format!("{} (required by {required_by})", path.display()),
        ),
        None => CheckResult::fail(
            format!("tool:{tool}"),
            format!("not found in PATH; required by {required_by}"),
        ),
    }
}

/// Preflight: local tools, per-host connectivity, on-host library
/// deployment, and power back-end reachability. Read-only; safe to run at
/// any time.
pub async fn run_checks(config: &BisectConfig) -> Vec<CheckResult> {
    let mut results = Vec::new();

    results.push(tool_check("ssh", "remote execution"));
    results.push(tool_check("scp", "file deployment"));
    if config
        .hosts
        .iter()
        .any(|host| host.power_control == PowerControlSelection::Ipmi)
        || config.console.collectors.iter().any(|key| key == "ipmi_sol")
    {
        results.push(tool_check("ipmitool", "ipmi power control / sol capture"));
    }
    if config
        .hosts
        .iter()
        .any(|host| host.power_control == PowerControlSelection::LabAutomation)
    {
        results.push(tool_check("bkr", "lab automation power control"));
    }

    for host in &config.hosts {
        let label = |check: &str| format!("{}:{check}", host.hostname);
        let remote = build_remote(config, host);

        if !remote.is_alive().await {
            results.push(CheckResult::fail(
                label("ssh"),
                "host does not answer; check power, network, and credentials",
            ));
            continue;
        }
        results.push(CheckResult::pass(label("ssh"), "host answers"));

        match remote
            .run(
                &format!("test -f {}", shell_quote(remote.library_file())),
                Some(CHECK_OP_TIMEOUT),
            )
            .await
        {
            Ok(output) if output.success() => {
                results.push(CheckResult::pass(label("library"), remote.library_file()));

                match remote
                    .call_op("verify_protection", &[], Some(CHECK_OP_TIMEOUT))
                    .await
                {
                    Ok(output) if output.success() => {
                        results.push(CheckResult::pass(
                            label("protection"),
                            "protected kernel files present",
                        ));
                    }
                    _ => results.push(CheckResult::warn(
                        label("protection"),
                        "protection not initialized; `kbisect init` will set it up",
                    )),
                }
            }
            _ => results.push(CheckResult::warn(
                label("library"),
                format!(
                    "{} missing; deploy the on-host library before `kbisect init`",
                    remote.library_file()
                ),
            )),
        }

        match remote
            .run(
                &format!("test -d {}/.git", shell_quote(&host.kernel_path)),
                Some(CHECK_OP_TIMEOUT),
            )
            .await
        {
            Ok(output) if output.success() => {
                results.push(CheckResult::pass(label("kernel-tree"), host.kernel_path.as_str()));
            }
            _ => results.push(CheckResult::warn(
                label("kernel-tree"),
                format!("{} is not a git tree on the host", host.kernel_path),
            )),
        }

        match kbisect_power::build_controller(&power_settings(host), remote) {
            Ok(controller) => match controller.status().await {
                Ok(state) => results.push(CheckResult::pass(
                    label("power"),
                    format!("{} reports {}", controller.provider_key(), state.as_key()),
                )),
                Err(err) => results.push(CheckResult::warn(
                    label("power"),
                    format!("{} status query failed: {err}", controller.provider_key()),
                )),
            },
            Err(err) => results.push(CheckResult::fail(label("power"), err.to_string())),
        }
    }

    results
}

#[cfg(test)]
mod tests {
    use super::{find_in_path, tool_check, CheckStatus};

    #[test]
    fn sh_is_found_in_path() {
        assert!(find_in_path("sh").is_some());
        assert!(find_in_path("definitely-not-a-real-tool-kb").is_none());
    }

    #[test]
    fn missing_tools_fail_the_check() {
        let result = tool_check("definitely-not-a-real-tool-kb", "nothing");
        assert_eq!(result.status, CheckStatus::Fail);
        assert!(result.detail.contains("not found"));

        let result = tool_check("sh", "everything");
        assert_eq!(result.status, CheckStatus::Pass);
    }
}
