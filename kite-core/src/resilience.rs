//! Timeout and retry policy for remote calls
//!
//! Retry scheduling is delegated to the `backon` crate; this module owns the
//! defaults and the policy value handed to the invocation layer.

pub mod timeout {
    //! Timeout defaults

    use std::time::Duration;

    /// Upper bound for establishing the coordination service connection
    pub const COORDINATION_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Default timeout for a single coordination read or write
    pub const COORDINATION_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

    /// Default per-attempt timeout for an RPC
    pub const RPC_CALL_TIMEOUT: Duration = Duration::from_secs(30);

    /// Default timeout for opening a transport connection
    pub const TRANSPORT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
}

pub mod retry {
    //! Retry policy applied at the transport dispatch boundary

    use std::time::Duration;

    use backon::ExponentialBuilder;

    use crate::config::ClientConfig;

    /// Upper bound for a single backoff sleep
    pub const MAX_BACKOFF: Duration = Duration::from_secs(10);

    /// Timeout and retry settings for one service
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CallPolicy {
        /// Per-attempt timeout, `None` waits indefinitely
        pub timeout: Option<Duration>,
        /// Additional attempts after the first failure
        pub max_retries: usize,
        pub min_backoff: Duration,
        pub max_backoff: Duration,
    }

    impl Default for CallPolicy {
        fn default() -> Self {
            Self {
                timeout: Some(super::timeout::RPC_CALL_TIMEOUT),
                max_retries: 0,
                min_backoff: Duration::from_millis(200),
                max_backoff: MAX_BACKOFF,
            }
        }
    }

    impl CallPolicy {
        /// A policy with no timeout and no retries
        #[must_use]
        pub const fn unbounded() -> Self {
            Self {
                timeout: None,
                max_retries: 0,
                min_backoff: Duration::from_millis(200),
                max_backoff: MAX_BACKOFF,
            }
        }

        #[must_use]
        pub const fn with_timeout(mut self, timeout: Duration) -> Self {
            self.timeout = Some(timeout);
            self
        }

        #[must_use]
        pub const fn with_retries(mut self, max_retries: usize) -> Self {
            self.max_retries = max_retries;
            self
        }

        #[must_use]
        pub const fn with_backoff(mut self, min: Duration, max: Duration) -> Self {
            self.min_backoff = min;
            self.max_backoff = max;
            self
        }

        /// Exponential backoff schedule for `backon`
        #[must_use]
        pub fn backoff(&self) -> ExponentialBuilder {
            ExponentialBuilder::default()
                .with_min_delay(self.min_backoff)
                .with_max_delay(self.max_backoff)
                .with_max_times(self.max_retries)
                .with_jitter()
        }
    }

    impl From<&ClientConfig> for CallPolicy {
        fn from(config: &ClientConfig) -> Self {
            Self {
                timeout: (config.timeout_secs > 0).then(|| Duration::from_secs(config.timeout_secs)),
                max_retries: config.max_retries,
                min_backoff: Duration::from_millis(config.retry_base_ms),
                max_backoff: MAX_BACKOFF,
            }
        }
    }

    /// Check if an I/O error is transient and worth retrying
    #[must_use]
    pub fn is_transient_io_error(err: &std::io::Error) -> bool {
        matches!(
            err.kind(),
            std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof
        )
    }
}

pub use retry::CallPolicy;
