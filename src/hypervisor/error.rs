//! Hypervisor error types
//!
//! Errors travel through result channels and session callbacks, so the type
//! is `Clone` and carries rendered messages rather than source errors.

/// Error types for driver operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HypervisorError {
    /// Persisted state belongs to another backend
    #[error("wrong driver type in persist info: expected {expected}, found {found}")]
    WrongDriver { expected: String, found: String },

    /// Persisted state is missing a field or has the wrong type
    #[error("invalid persist info: {0}")]
    InvalidPersistedState(String),

    /// The process or domain backing a context is gone
    #[error("can not serialize context: {0}")]
    NotRunning(String),

    /// A QMP session failed
    #[error("QMP command failed: {0}")]
    Qmp(String),

    /// The QMP handler terminated before the session ran
    #[error("QMP handler exited")]
    QmpHandlerExited,

    /// CPU hotplug only grows
    #[error("can't reduce cpus number from {current} to {requested}")]
    CannotReduceCpus { current: u32, requested: u32 },

    /// Operation not offered by a backend
    #[error("{driver} driver doesn't support {operation}")]
    Unsupported {
        operation: &'static str,
        driver: &'static str,
    },

    /// Pause/resume not offered by a backend
    #[error("doesn't support pause for {0} right now")]
    PauseUnsupported(&'static str),

    /// No domain is bound to the context
    #[error("Cannot find domain")]
    DomainNotFound,

    /// SCSI id outside the addressable range
    #[error("id {0} too long, exceed 256*256")]
    ScsiIdOverflow(u32),

    /// libvirt call failed
    #[error("libvirt: {0}")]
    Libvirt(String),

    /// Xen toolstack call failed
    #[error("xen: {0}")]
    Xen(String),

    /// Driver exists but this host cannot run it
    #[error("driver {0} is not available on this host")]
    DriverUnavailable(String),

    /// Unknown driver name
    #[error("Unsupported driver {0}")]
    UnsupportedDriver(String),

    /// I/O failure
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for HypervisorError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
