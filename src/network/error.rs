//! Port mapping error types

/// iptables invocation failures
#[derive(Debug, thiserror::Error)]
pub enum IptablesError {
    #[error("Iptables not found")]
    NotFound,

    /// iptables exited non-zero
    #[error("iptables failed: iptables {args}: {output}")]
    Command { args: String, output: String },

    /// A modifying command printed something, which iptables only does on trouble
    #[error("Error iptables {chain}: {output}")]
    Chain { chain: String, output: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum PortMappingError {
    #[error("{0}")]
    InvalidRange(String),

    #[error("range mismatch, cannot map ports {from} to {to}")]
    RangeMismatch { from: String, to: String },

    #[error("unsupported protocol {0}")]
    UnsupportedProtocol(String),

    #[error("{0}")]
    PortInUse(String),

    #[error(transparent)]
    Iptables(#[from] IptablesError),

    /// Setup failed and was rolled back; `revert_failures` lists the rules
    /// that could not be removed again.
    #[error("{source}{}", revert_suffix(.revert_failures))]
    Setup {
        source: Box<PortMappingError>,
        revert_failures: Vec<String>,
    },
}

fn revert_suffix(failures: &[String]) -> String {
    if failures.is_empty() {
        String::new()
    } else {
        format!(" ({} rules not reverted)", failures.len())
    }
}

impl PortMappingError {
    /// The failure that started a rollback, or `self`.
    pub fn root(&self) -> &PortMappingError {
        match self {
            Self::Setup { source, .. } => source.root(),
            other => other,
        }
    }
}
