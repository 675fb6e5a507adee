use http::StatusCode;

/// Errors surfaced by the backend.
///
/// Authentication expiry is not a separate variant: it arrives as an API
/// error with status 401 and is recognised with [`Error::is_auth_expired`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("context {0:?} is not configured")]
    ContextNotFound(String),

    #[error("{product} is not installed in this cluster (missing CRD {crd})")]
    ExtensionNotInstalled { crd: String, product: String },

    #[error("no kubeconfig could be found")]
    NoKubeconfig,

    #[error("kubeconfig: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error("unsupported operation for {kind}: {operation}")]
    Unsupported { kind: String, operation: String },

    #[error("watch of {0} was closed by the server twice without progress")]
    WatchClosed(String),

    #[error("port-forward: {0}")]
    PortForward(String),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("settings: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    fn api_code(&self) -> Option<u16> {
        match self {
            Error::Kube(kube::Error::Api(response)) => Some(response.code),
            _ => None,
        }
    }

    /// The API server rejected the credentials (HTTP 401).
    pub fn is_auth_expired(&self) -> bool {
        self.api_code() == Some(StatusCode::UNAUTHORIZED.as_u16())
    }

    /// The target does not exist or is hidden from us (HTTP 404 / 403).
    pub fn is_absent(&self) -> bool {
        matches!(
            self.api_code().and_then(|c| StatusCode::from_u16(c).ok()),
            Some(StatusCode::NOT_FOUND | StatusCode::FORBIDDEN)
        )
    }
}

#[cfg(test)]
pub(crate) fn api_error(code: u16) -> Error {
    let reason = StatusCode::from_u16(code)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown")
        .to_string();
    Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: reason.clone(),
        reason,
        code,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_api_errors() {
        assert!(api_error(401).is_auth_expired());
        assert!(!api_error(401).is_absent());
        assert!(api_error(404).is_absent());
        assert!(api_error(403).is_absent());
        assert!(!api_error(500).is_auth_expired());
        assert!(!Error::ContextNotFound("x".into()).is_auth_expired());
    }

    #[test]
    fn extension_error_names_product() {
        let err = Error::ExtensionNotInstalled {
            crd: "scaledobjects.keda.sh".into(),
            product: "KEDA".into(),
        };
        assert_eq!(
            err.to_string(),
            "KEDA is not installed in this cluster (missing CRD scaledobjects.keda.sh)"
        );
    }
}
