use thiserror::Error;

/// Errors produced by the kube2lb library modules.
#[derive(Error, Debug)]
pub enum Kube2lbError {
    #[error("unknown signal name '{0}'")]
    UnknownSignal(String),

    #[error("invalid notifier definition '{0}': {1}")]
    NotifierDefinition(String, String),

    #[error("couldn't notify: {0}")]
    Notify(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("Kubernetes client error: {0}")]
    Client(#[from] kube::Error),

    #[error("Kubernetes client configuration error: {0}")]
    ClientConfig(String),

    #[error("couldn't watch events on {kind}: {message}")]
    Watch { kind: &'static str, message: String },

    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("service rejected: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
