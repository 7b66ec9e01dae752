// Process exit codes for the chatgen CLI.
//
//   0  = success
//   1  = general error
//   2  = usage/argument error
//   3  = configuration error
//   11 = authentication error (reauthentication required)
//   13 = network error (bus unreachable, retries exhausted)
//   20 = load test had no connected clients

use std::process;

use chatgen_client::auth::{AuthError, RefreshError};
use chatgen_client::config::ConfigError;
use chatgen_client::fleet::FleetError;
use chatgen_client::recorder::RecorderError;
use chatgen_client::session::SessionError;
use chatgen_client::transport::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    Error = 1,
    Usage = 2,
    Config = 3,
    Auth = 11,
    Network = 13,
    FleetFailed = 20,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::Usage => "USAGE",
            Self::Config => "CONFIG",
            Self::Auth => "AUTH",
            Self::Network => "NETWORK",
            Self::FleetFailed => "FLEET_FAILED",
        }
    }

    /// Map an anyhow error to an exit code by inspecting the error chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if cause.is::<ConfigError>() {
                return Self::Config;
            }
            if cause.is::<FleetError>() {
                return Self::FleetFailed;
            }
            if let Some(session) = cause.downcast_ref::<SessionError>() {
                return match session {
                    SessionError::ReauthenticationRequired { .. } => Self::Auth,
                    SessionError::RetriesExhausted { .. } | SessionError::Connect(_) => Self::Network,
                    SessionError::ReconnectInProgress => Self::Error,
                };
            }
            if let Some(refresh) = cause.downcast_ref::<RefreshError>() {
                return match refresh {
                    RefreshError::ReauthenticationRequired { .. } => Self::Auth,
                    RefreshError::Provider(AuthError::MissingSecret) => Self::Config,
                    RefreshError::Provider(_) => Self::Auth,
                };
            }
            if let Some(auth) = cause.downcast_ref::<AuthError>() {
                return match auth {
                    AuthError::MissingSecret | AuthError::InvalidSecretEncoding(_) => Self::Config,
                    _ => Self::Auth,
                };
            }
            if cause.is::<TransportError>() || cause.is::<reqwest::Error>() {
                return Self::Network;
            }
            if let Some(RecorderError::Http(_)) = cause.downcast_ref::<RecorderError>() {
                return Self::Network;
            }
            if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
                return match io_err.kind() {
                    std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::TimedOut => {
                        Self::Network
                    }
                    _ => Self::Error,
                };
            }
        }
        Self::Error
    }
}

impl From<ExitCode> for process::ExitCode {
    fn from(code: ExitCode) -> Self {
        process::ExitCode::from(code.code() as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use chatgen_client::fleet::FleetReport;

    #[test]
    fn exit_code_values() {
        assert_eq!(ExitCode::Success.code(), 0);
        assert_eq!(ExitCode::Error.code(), 1);
        assert_eq!(ExitCode::Usage.code(), 2);
        assert_eq!(ExitCode::Config.code(), 3);
        assert_eq!(ExitCode::Auth.code(), 11);
        assert_eq!(ExitCode::Network.code(), 13);
        assert_eq!(ExitCode::FleetFailed.code(), 20);
    }

    #[test]
    fn config_error_in_chain() {
        let err = anyhow::Error::new(ConfigError::Missing { key: "CHATGEN_SECRET_KEY" })
            .context("bot needs a bus");
        assert_eq!(ExitCode::from_error(&err), ExitCode::Config);
    }

    #[test]
    fn session_errors_split_auth_and_network() {
        let exhausted = anyhow::Error::new(SessionError::RetriesExhausted {
            attempts: 5,
            last_error: "refused".into(),
        });
        assert_eq!(ExitCode::from_error(&exhausted), ExitCode::Network);

        let reauth = anyhow::Error::new(SessionError::ReauthenticationRequired {
            connect_error: "rejected".into(),
            source: RefreshError::ReauthenticationRequired { reason: "expired".into() },
        });
        assert_eq!(ExitCode::from_error(&reauth), ExitCode::Auth);
    }

    #[test]
    fn missing_secret_is_configuration() {
        let err = Err::<(), _>(AuthError::MissingSecret).context("building token provider").unwrap_err();
        assert_eq!(ExitCode::from_error(&err), ExitCode::Config);
    }

    #[test]
    fn fleet_total_failure() {
        let err = anyhow::Error::new(FleetError::NoClientsConnected {
            attempted: 3,
            report: Box::new(FleetReport::default()),
        });
        assert_eq!(ExitCode::from_error(&err), ExitCode::FleetFailed);
    }

    #[test]
    fn transport_error_is_network() {
        let err = anyhow::Error::new(TransportError::Connect {
            endpoint: "ws://localhost/ws".into(),
            reason: "refused".into(),
        });
        assert_eq!(ExitCode::from_error(&err), ExitCode::Network);
    }

    #[test]
    fn generic_is_error() {
        let err = anyhow::anyhow!("something went wrong");
        assert_eq!(ExitCode::from_error(&err), ExitCode::Error);
        assert_eq!(ExitCode::Error.name(), "ERROR");
    }
}
