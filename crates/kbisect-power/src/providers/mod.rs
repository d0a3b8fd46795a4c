pub mod ipmi;
pub mod lab_automation;
pub mod shell_reboot;
