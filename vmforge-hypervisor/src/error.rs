//! Error types for the VM lifecycle library.

use thiserror::Error;

/// Errors that can occur during provisioning and lifecycle operations.
#[derive(Error, Debug)]
pub enum HypervisorError {
    /// The named object does not exist.
    ///
    /// Callers may treat this as a non-fatal "does not exist" condition.
    #[error("Object not found: {name}: {reason}")]
    NotFound { name: String, reason: String },

    /// The placement target does not carry the requested networks or datastore.
    #[error("Invalid host {host}: datastore {datastore:?} or networks {networks:?} not available")]
    InvalidHost {
        host: String,
        datastore: Option<String>,
        networks: Vec<String>,
    },

    /// Reading properties of a managed object failed.
    #[error("Failed to retrieve properties {properties:?} of {object}: {reason}")]
    PropertyRetrieval {
        object: String,
        properties: Vec<String>,
        reason: String,
    },

    /// An HTTP transfer returned an unexpected status.
    #[error("Bad response: status {status}: {body}")]
    BadResponse { status: u16, body: String },

    /// The SDK endpoint URL could not be built.
    #[error("Failed to parse URL {url}: {reason}")]
    ParsingUrl { url: String, reason: String },

    /// The backend client could not be set up.
    #[error("Failed to create client: {0}")]
    ClientFailed(String),

    /// The VM is shutting down or resetting.
    #[error("VM power state is changing, retry later")]
    PowerStateChanging,

    /// The destination kind is not supported by this backend.
    #[error("Destination type not supported")]
    DestinationNotSupported,

    /// The destination cluster has no hosts.
    #[error("No hosts found in the cluster")]
    NoHostsInCluster,

    /// No host in the destination cluster satisfies the request.
    #[error("No suitable hosts found in the cluster")]
    NoSuitableHosts,

    /// A requested disk size is smaller than the template disk.
    #[error("Shrinking virtual disks is not supported: {disk}")]
    ShrinkNotSupported { disk: String },

    /// A blocking wait exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The session was cancelled while waiting.
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// A task completed with an embedded fault.
    #[error("Task {task} failed: {fault}")]
    TaskFault { task: String, fault: String },

    /// The object was deleted while it was being read.
    #[error("Managed object has been deleted: {0}")]
    ObjectDeleted(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Local file I/O failed (OVA extraction, disk image read).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic backend fault.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HypervisorError {
    /// Build a [`HypervisorError::NotFound`].
    pub fn not_found(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NotFound {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Wrap a failure with additional context, keeping typed variants intact.
    ///
    /// Conditions callers branch on (not found, timeouts, cancellation,
    /// deleted objects, power state, task faults) are returned unchanged.
    /// Transport and retrieval failures keep their variant with the context
    /// prepended to their message.
    pub fn context(self, context: impl std::fmt::Display) -> Self {
        match self {
            Self::BadResponse { status, body } => Self::BadResponse {
                status,
                body: format!("{}: {}", context, body),
            },
            Self::PropertyRetrieval {
                object,
                properties,
                reason,
            } => Self::PropertyRetrieval {
                object,
                properties,
                reason: format!("{}: {}", context, reason),
            },
            Self::ParsingUrl { url, reason } => Self::ParsingUrl {
                url,
                reason: format!("{}: {}", context, reason),
            },
            Self::ClientFailed(reason) => Self::ClientFailed(format!("{}: {}", context, reason)),
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), format!("{}: {}", context, e))),
            Self::NotFound { .. }
            | Self::Timeout(_)
            | Self::Cancelled(_)
            | Self::ObjectDeleted(_)
            | Self::PowerStateChanging
            | Self::ShrinkNotSupported { .. }
            | Self::TaskFault { .. }
            | Self::InvalidHost { .. } => self,
            other => Self::Backend(format!("{}: {}", context, other)),
        }
    }

    /// Returns true if the object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if the object vanished mid-read.
    pub fn is_object_deleted(&self) -> bool {
        matches!(self, Self::ObjectDeleted(_))
    }

    /// Returns true for deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Result type alias for hypervisor operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_preserves_not_found() {
        let err = HypervisorError::not_found("vm-1", "could not find the vm")
            .context("error retrieving template");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_context_keeps_transport_variants() {
        let err = HypervisorError::BadResponse {
            status: 500,
            body: "upload rejected".to_string(),
        }
        .context("error uploading the ovf template");
        assert!(matches!(err, HypervisorError::BadResponse { status: 500, .. }));
        assert_eq!(
            err.to_string(),
            "Bad response: status 500: error uploading the ovf template: upload rejected"
        );

        let err = HypervisorError::PropertyRetrieval {
            object: "vm-42".to_string(),
            properties: vec!["config".to_string()],
            reason: "fault".to_string(),
        }
        .context("error retrieving template");
        assert!(matches!(err, HypervisorError::PropertyRetrieval { ref object, .. } if object == "vm-42"));

        let err = HypervisorError::ClientFailed("refused".to_string()).context("connect");
        assert!(matches!(err, HypervisorError::ClientFailed(_)));

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.ovf");
        let err = HypervisorError::from(io).context("error reading descriptor");
        match err {
            HypervisorError::Io(e) => {
                assert_eq!(e.kind(), std::io::ErrorKind::NotFound);
                assert!(e.to_string().contains("error reading descriptor"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_context_wraps_backend_faults() {
        let err = HypervisorError::Backend("fault".to_string()).context("clone");
        assert_eq!(err.to_string(), "Backend error: clone: Backend error: fault");
    }
}
