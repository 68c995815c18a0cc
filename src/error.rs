use thiserror::Error;

/// Failures of the socket diagnostics channel.
#[derive(Debug, Error)]
pub enum DiagError {
    #[error("diagnostic socket I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("netlink request failed with errno {errno}")]
    Netlink { errno: i32 },

    #[error("truncated diagnostic message at offset {offset}")]
    Truncated { offset: usize },

    #[error("socket diagnostics are not supported on this platform")]
    Unsupported,
}

impl DiagError {
    /// Permission problems mean the overlay can never work for this user.
    pub fn is_permission_denied(&self) -> bool {
        match self {
            DiagError::Io(e) => e.kind() == std::io::ErrorKind::PermissionDenied,
            DiagError::Netlink { errno } => *errno == libc::EPERM || *errno == libc::EACCES,
            _ => false,
        }
    }
}
