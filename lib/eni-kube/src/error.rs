use thiserror::Error;

pub type Result<T> = std::result::Result<T, KubeError>;

#[derive(Error, Debug)]
pub enum KubeError {
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Node {0} has no providerID")]
    MissingProviderId(String),

    #[error("Cannot extract an instance id from providerID {0:?}")]
    InvalidProviderId(String),
}
