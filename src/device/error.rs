use thiserror::Error;

/// Failures talking to the device. These are the only fatal errors in the
/// pipeline: the caller should stop issuing commands and surface the
/// guidance to the operator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error(
        "SSH authentication failed for {username}@{host}. Verify the username and \
         password, and that SSH access is enabled for this account. Try manually: \
         ssh {username}@{host}"
    )]
    AuthenticationFailed { host: String, username: String },

    #[error(
        "Connection to {host}:{port} timed out or was refused after {secs}s. Verify the \
         address is correct and reachable (ping {host}), SSH is enabled on the device, \
         port {port} is not filtered, and the device is powered on"
    )]
    Timeout { host: String, port: u16, secs: u64 },

    #[error("Command '{command}' produced no output within {secs}s; the device may be busy")]
    CommandTimeout { command: String, secs: u64 },

    #[error(
        "Command '{command}' returned output but the device prompt never came back. \
         Avoid compound or piped commands and send a single show command instead"
    )]
    PatternMismatch { command: String },

    #[error("Connection to {host} failed: {detail}. Check device accessibility and credentials")]
    Generic { host: String, detail: String },

    #[error(
        "Connection to {host} lost; {attempts} reconnect attempt(s) failed. \
         Connect again before sending more commands"
    )]
    ConnectionLost { host: String, attempts: u32 },

    #[error("No active device session; connect first")]
    NotConnected,
}

impl ConnectionError {
    /// Stable category tag for audit records.
    pub fn category(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed { .. } => "authentication_failed",
            Self::Timeout { .. } | Self::CommandTimeout { .. } => "timeout",
            Self::PatternMismatch { .. } => "pattern_mismatch",
            Self::Generic { .. } => "generic",
            Self::ConnectionLost { .. } => "connection_lost",
            Self::NotConnected => "not_connected",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_guidance() {
        let auth = ConnectionError::AuthenticationFailed {
            host: "10.0.0.1".into(),
            username: "netops".into(),
        };
        assert!(auth.to_string().contains("ssh netops@10.0.0.1"));
        assert_eq!(auth.category(), "authentication_failed");

        let timeout = ConnectionError::Timeout {
            host: "10.0.0.1".into(),
            port: 22,
            secs: 30,
        };
        assert!(timeout.to_string().contains("ping 10.0.0.1"));
        assert!(timeout.to_string().contains("port 22"));

        let mismatch = ConnectionError::PatternMismatch {
            command: "show run | include x".into(),
        };
        assert!(mismatch.to_string().contains("piped"));
        assert_eq!(mismatch.category(), "pattern_mismatch");
    }

    #[test]
    fn both_timeouts_share_a_category() {
        let cmd = ConnectionError::CommandTimeout {
            command: "show tech".into(),
            secs: 60,
        };
        assert_eq!(cmd.category(), "timeout");
        assert_eq!(
            ConnectionError::ConnectionLost {
                host: "r1".into(),
                attempts: 3
            }
            .category(),
            "connection_lost"
        );
    }
}
