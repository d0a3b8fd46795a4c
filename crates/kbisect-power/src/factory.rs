use std::sync::Arc;

use kbisect_remote::RemoteExec;

use crate::interface::{
    CommandRunner, PowerControlKind, PowerController, PowerError, ProcessCommandRunner,
};
use crate::providers::ipmi::IpmiController;
use crate::providers::lab_automation::LabAutomationController;
use crate::providers::shell_reboot::ShellRebootController;

const SUPPORTED_PROVIDER_KEYS: [&str; 3] = [
    PowerControlKind::Ipmi.as_key(),
    PowerControlKind::LabAutomation.as_key(),
    PowerControlKind::ShellReboot.as_key(),
];

pub fn supported_provider_keys() -> &'static [&'static str] {
    &SUPPORTED_PROVIDER_KEYS
}

/// Per-host power settings, extracted from the host configuration.
/// Credentials live here only for the duration of controller construction.
#[derive(Clone)]
pub struct PowerSettings {
    pub kind: PowerControlKind,
    pub host_fqdn: String,
    pub ipmi_host: Option<String>,
    pub ipmi_user: Option<String>,
    pub ipmi_password: Option<String>,
}

impl PowerSettings {
    pub fn shell_reboot(host_fqdn: impl Into<String>) -> Self {
        Self {
            kind: PowerControlKind::ShellReboot,
            host_fqdn: host_fqdn.into(),
            ipmi_host: None,
            ipmi_user: None,
            ipmi_password: None,
        }
    }
}

pub fn build_controller(
    settings: &PowerSettings,
    remote: Arc<dyn RemoteExec>,
) -> Result<Arc<dyn PowerController>, PowerError> {
    build_controller_with_runner(settings, remote, Arc::new(ProcessCommandRunner))
}

pub fn build_controller_with_runner(
    settings: &PowerSettings,
    remote: Arc<dyn RemoteExec>,
    runner: Arc<dyn CommandRunner>,
) -> Result<Arc<dyn PowerController>, PowerError> {
    match settings.kind {
        PowerControlKind::Ipmi => {
            let bmc_host = settings.ipmi_host.as_deref().filter(|v| !v.is_empty());
            let (Some(bmc_host), Some(user), Some(password)) = (
                bmc_host,
                settings.ipmi_user.as_deref(),
                settings.ipmi_password.as_deref(),
            ) else {
                return Err(PowerError::Configuration(format!(
                    "host {} selects {} but lacks ipmi_host/ipmi_user/ipmi_password",
                    settings.host_fqdn,
                    PowerControlKind::Ipmi.as_key()
                )));
            };
            Ok(Arc::new(IpmiController::new(runner, bmc_host, user, password)))
        }
        PowerControlKind::LabAutomation => Ok(Arc::new(LabAutomationController::new(
            runner,
            settings.host_fqdn.clone(),
        ))),
        PowerControlKind::ShellReboot => Ok(Arc::new(ShellRebootController::new(remote))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use kbisect_core::HostId;
    use kbisect_remote::{RemoteExec, SshRemote};

    use super::{build_controller, supported_provider_keys, PowerSettings};
    use crate::interface::{PowerControlKind, PowerController, PowerError};

    fn remote() -> Arc<dyn RemoteExec> {
        Arc::new(SshRemote::new(
            HostId::new("h1"),
            "root",
            "/root/kernel-bisect/lib/bisect-functions.sh",
            Duration::from_secs(15),
        ))
    }

    #[test]
    fn supported_keys_roundtrip_through_kind_resolution() {
        for key in supported_provider_keys() {
            let kind = PowerControlKind::from_key(key).expect("resolve key");
            assert_eq!(kind.as_key(), *key);
        }
    }

    #[test]
    fn shell_reboot_needs_no_credentials() {
        let controller = build_controller(&PowerSettings::shell_reboot("h1"), remote())
            .expect("build shell reboot controller");
        assert_eq!(controller.kind(), PowerControlKind::ShellReboot);
        assert!(!controller.can_recover_unreachable());
    }

    #[test]
    fn ipmi_without_credentials_is_a_configuration_error() {
        let settings = PowerSettings {
            kind: PowerControlKind::Ipmi,
            host_fqdn: "h1".to_owned(),
            ipmi_host: None,
            ipmi_user: None,
            ipmi_password: None,
        };
        let error = build_controller(&settings, remote()).expect_err("missing credentials");
        assert!(matches!(error, PowerError::Configuration(_)));
    }

    #[test]
    fn ipmi_with_credentials_builds() {
        let settings = PowerSettings {
            kind: PowerControlKind::Ipmi,
            host_fqdn: "h1".to_owned(),
            ipmi_host: Some("h1-bmc".to_owned()),
            ipmi_user: Some("admin".to_owned()),
            ipmi_password: Some("secret".to_owned()),
        };
        let controller = build_controller(&settings, remote()).expect("build ipmi controller");
        assert_eq!(controller.kind(), PowerControlKind::Ipmi);
        assert!(controller.can_recover_unreachable());
    }

    #[test]
    fn lab_automation_builds_from_fqdn_alone() {
        let settings = PowerSettings {
            kind: PowerControlKind::LabAutomation,
            host_fqdn: "box1.lab.example.com".to_owned(),
            ipmi_host: None,
            ipmi_user: None,
            ipmi_password: None,
        };
        let controller = build_controller(&settings, remote()).expect("build controller");
        assert_eq!(controller.kind(), PowerControlKind::LabAutomation);
    }
}
