use super::*;

/// Everything that can terminate an [`crate::interface::Interface`]'s root task.
///
/// `RequestCorrupted` and the certificate-policy variants are always fatal to
/// the session. `GracefulDisconnect` and `RequestTimedOut` are "expected"
/// terminations: the root task logs them at `log_level` and tears the
/// interface down cleanly rather than propagating a panic or bubbling an
/// unrelated error up to the supervisor.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PeerError {
    #[snafu(display("server response corrupted: {reason}"))]
    RequestCorrupted { reason: String },

    #[snafu(display("request timed out after {elapsed_secs}s"))]
    RequestTimedOut { elapsed_secs: u64 },

    #[snafu(display("{reason}"))]
    GracefulDisconnect {
        reason: String,
        log_level: tracing::Level,
    },

    #[snafu(display("io error: {source}"))]
    Connect { source: std::io::Error },

    #[cfg(feature = "client")]
    #[snafu(display("tls verification failed: {source}"))]
    TlsVerify { source: rustls::Error },

    #[snafu(display("error parsing ssl certificate: {reason}"))]
    ParsingSslCert { reason: String },

    #[snafu(display("error getting ssl certificate from server: {reason}"))]
    GettingSslCertFromServer { reason: String },

    #[snafu(display("refusing to connect: server certificate fingerprint mismatch"))]
    SslCertFingerprintMismatch,

    #[snafu(display("invalid option combination: {reason}"))]
    InvalidOptionCombination { reason: String },

    #[snafu(display("server rpc error {code}: {message}"))]
    Rpc { code: i32, message: String },

    #[snafu(display("serialization error: {source}"))]
    Serialization { source: serde_json::Error },

    #[snafu(display("channel closed"))]
    ChannelClosed,
}

pub type Result<T, E = PeerError> = std::result::Result<T, E>;

impl PeerError {
    pub fn graceful(reason: impl Into<String>) -> Self {
        Self::GracefulDisconnect {
            reason: reason.into(),
            log_level: tracing::Level::INFO,
        }
    }

    pub fn graceful_at(reason: impl Into<String>, log_level: tracing::Level) -> Self {
        Self::GracefulDisconnect {
            reason: reason.into(),
            log_level,
        }
    }

    pub fn corrupted(reason: impl Into<String>) -> Self {
        Self::RequestCorrupted {
            reason: reason.into(),
        }
    }

    /// Whether the root task should treat this as an expected, loggable
    /// disconnect rather than an unexpected failure.
    pub fn is_graceful(&self) -> bool {
        matches!(
            self,
            Self::GracefulDisconnect { .. } | Self::RequestTimedOut { .. }
        )
    }

    pub fn log_level(&self) -> tracing::Level {
        match self {
            Self::GracefulDisconnect { log_level, .. } => *log_level,
            _ => tracing::Level::WARN,
        }
    }
}

/// JSON-RPC error codes that downgrade a child-task failure to a graceful
/// disconnect rather than propagating (spec.md #4.6).
pub mod rpc_code {
    pub const EXCESSIVE_RESOURCE_USAGE: i32 = 1;
    pub const SERVER_BUSY: i32 = 2;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INTERNAL_ERROR: i32 = -32603;
}

pub fn is_downgradable_rpc_code(code: i32) -> bool {
    use rpc_code::*;
    matches!(
        code,
        EXCESSIVE_RESOURCE_USAGE | SERVER_BUSY | METHOD_NOT_FOUND | INTERNAL_ERROR
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graceful_disconnect_is_graceful() {
        let err = PeerError::graceful("slow readiness");
        assert!(err.is_graceful());
        assert_eq!(err.log_level(), tracing::Level::INFO);
    }

    #[test]
    fn request_corrupted_is_not_graceful() {
        let err = PeerError::corrupted("bad shape");
        assert!(!err.is_graceful());
    }

    #[test]
    fn downgradable_codes() {
        assert!(is_downgradable_rpc_code(rpc_code::INTERNAL_ERROR));
        assert!(is_downgradable_rpc_code(rpc_code::METHOD_NOT_FOUND));
        assert!(!is_downgradable_rpc_code(-32000));
    }
}
