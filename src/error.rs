use thiserror::Error;

/// Error taxonomy shared by the store, the manager and the deployment engine.
///
/// The first variants map 1:1 onto the machine-readable error kinds carried
/// over the wire; everything else is reported as `internal`.
#[derive(Error, Debug)]
pub enum GpmError {
    #[error("service '{0}' not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("process for service '{0}' not found")]
    ProcessNotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl GpmError {
    /// Stable kind string used on the wire and matched by clients.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) | Self::ProcessNotFound(_) => "not-found",
            Self::Conflict(_) => "conflict",
            Self::BadRequest(_) => "bad-request",
            Self::Io(_) | Self::Serialization(_) | Self::Internal(_) => "internal",
        }
    }

    pub fn from_wire(kind: &str, message: String) -> Self {
        match kind {
            "not-found" => Self::NotFound(message),
            "conflict" => Self::Conflict(message),
            "bad-request" => Self::BadRequest(message),
            _ => Self::Internal(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, GpmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_over_the_wire() {
        let err = GpmError::Conflict("service 'web' already exists".into());
        let back = GpmError::from_wire(err.kind(), err.to_string());
        assert!(matches!(back, GpmError::Conflict(_)));
    }

    #[test]
    fn process_not_found_maps_to_not_found_kind() {
        assert_eq!(GpmError::ProcessNotFound("web".into()).kind(), "not-found");
    }
}
