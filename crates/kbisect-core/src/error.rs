use serde::{Deserialize, Serialize};

/// Failure classification recorded alongside host outcomes and iteration
/// error summaries. Kinds, not free-form names, so reports and tests can
/// match on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConfigInvalid,
    RemoteUnreachable,
    RemoteAuth,
    RemoteChannelLost,
    BuildFailed,
    InstallFailed,
    BootFallback,
    BootTimeout,
    PowerBackendFailure,
    TestFailed,
    TestTimeout,
    StoreIo,
    VcsMarkRejected,
}

impl ErrorKind {
    pub const fn as_key(self) -> &'static str {
        match self {
            Self::ConfigInvalid => "config_invalid",
            Self::RemoteUnreachable => "remote_unreachable",
            Self::RemoteAuth => "remote_auth",
            Self::RemoteChannelLost => "remote_channel_lost",
            Self::BuildFailed => "build_failed",
            Self::InstallFailed => "install_failed",
            Self::BootFallback => "boot_fallback",
            Self::BootTimeout => "boot_timeout",
            Self::PowerBackendFailure => "power_backend_failure",
            Self::TestFailed => "test_failed",
            Self::TestTimeout => "test_timeout",
            Self::StoreIo => "store_io",
            Self::VcsMarkRejected => "vcs_mark_rejected",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "config_invalid" => Some(Self::ConfigInvalid),
            "remote_unreachable" => Some(Self::RemoteUnreachable),
            "remote_auth" => Some(Self::RemoteAuth),
            "remote_channel_lost" => Some(Self::RemoteChannelLost),
            "build_failed" => Some(Self::BuildFailed),
            "install_failed" => Some(Self::InstallFailed),
            "boot_fallback" => Some(Self::BootFallback),
            "boot_timeout" => Some(Self::BootTimeout),
            "power_backend_failure" => Some(Self::PowerBackendFailure),
            "test_failed" => Some(Self::TestFailed),
            "test_timeout" => Some(Self::TestTimeout),
            "store_io" => Some(Self::StoreIo),
            "vcs_mark_rejected" => Some(Self::VcsMarkRejected),
            _ => None,
        }
    }

    /// Fatal kinds stop the session outright instead of flowing into the
    /// per-host phase machine.
    pub const fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::ConfigInvalid | Self::StoreIo | Self::VcsMarkRejected
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_key())
    }
}

#[cfg(test)]
mod tests {
    use super::ErrorKind;

    const ALL: [ErrorKind; 13] = [
        ErrorKind::ConfigInvalid,
        ErrorKind::RemoteUnreachable,
        ErrorKind::RemoteAuth,
        ErrorKind::RemoteChannelLost,
        ErrorKind::BuildFailed,
        ErrorKind::InstallFailed,
        ErrorKind::BootFallback,
        ErrorKind::BootTimeout,
        ErrorKind::PowerBackendFailure,
        ErrorKind::TestFailed,
        ErrorKind::TestTimeout,
        ErrorKind::StoreIo,
        ErrorKind::VcsMarkRejected,
    ];

    #[test]
    fn keys_roundtrip() {
        for kind in ALL {
            assert_eq!(ErrorKind::from_key(kind.as_key()), Some(kind));
        }
        assert_eq!(ErrorKind::from_key("kernel_panic"), None);
    }

    #[test]
    fn only_config_store_and_vcs_kinds_are_fatal() {
        for kind in ALL {
            let expected = matches!(
                kind,
                ErrorKind::ConfigInvalid | ErrorKind::StoreIo | ErrorKind::VcsMarkRejected
            );
            assert_eq!(kind.is_fatal(), expected, "{kind}");
        }
    }
}
