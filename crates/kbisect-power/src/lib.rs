//! Power control capability: query, on, off, reset, and cycle a test host's
//! power through one of three back ends — out-of-band IPMI, a lab-automation
//! reboot API, or plain reboot over the remote shell (the null variant).

mod factory;
mod interface;
mod providers;

pub use factory::{build_controller, supported_provider_keys, PowerSettings};
pub use interface::{
    CommandRunner, PowerControlKind, PowerController, PowerError, PowerResult, PowerState,
    ProcessCommandRunner,
};
pub use providers::ipmi::IpmiController;
pub use providers::lab_automation::LabAutomationController;
pub use providers::shell_reboot::ShellRebootController;
