//! Error taxonomy for the conversion pipeline.
//!
//! Every failure carries a stable [`ErrorKind`] so callers and tests can
//! assert on the class of a failure without matching message text. The
//! pipeline wraps failures in [`Error::Step`] to attach the step that
//! raised them.

use std::path::Path;

use thiserror::Error;

/// Stable classification for every [`Error`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConfigInvalid,
    ManifestShape,
    NamespaceConflict,
    SecretClusterUnreachable,
    SecretQueryFailed,
    SecretNotFound,
    PortConflict,
    CertMaterialMissing,
    KbsUnreachable,
    UploadFailed,
    PathTraversal,
    NetworkBlocked,
    DocumentTooLarge,
    YamlInvalid,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {reason}")]
    ConfigInvalid { reason: String },

    #[error("unexpected manifest shape: {reason}")]
    ManifestShape { reason: String },

    #[error("namespace flag '{flag}' conflicts with manifest namespace '{manifest}'")]
    NamespaceConflict { flag: String, manifest: String },

    #[error(
        "cluster unreachable while secret lookup is required for {references:?}: {reason}; \
         pre-create the secrets, switch to inline item keys, or run without secret conversion"
    )]
    SecretClusterUnreachable {
        references: Vec<String>,
        reason: String,
    },

    #[error("failed to query {resource}: {reason}")]
    SecretQueryFailed { resource: String, reason: String },

    #[error(
        "{resource} not found; create it before converting, switch to inline item keys, \
         or run without secret conversion"
    )]
    SecretNotFound { resource: String },

    #[error("forward port {port} conflicts with the sidecar HTTPS port")]
    PortConflict { port: u16 },

    #[error("certificate material unavailable: {reason}")]
    CertMaterialMissing { reason: String },

    #[error("KBS endpoint {url} unreachable: {reason}")]
    KbsUnreachable { url: String, reason: String },

    #[error("upload to {target} failed: {reason}")]
    UploadFailed { target: String, reason: String },

    #[error("path '{path}' escapes the load root '{root}'")]
    PathTraversal { path: String, root: String },

    #[error("refusing remote manifest source '{url}'; download it first and pass a local path")]
    NetworkBlocked { url: String },

    #[error("document limits exceeded in '{path}': {reason}")]
    DocumentTooLarge { path: String, reason: String },

    #[error("invalid YAML in '{path}': {reason}")]
    YamlInvalid { path: String, reason: String },

    #[error("{step}: {source}")]
    Step {
        step: &'static str,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// The stable kind of this error. [`Error::Step`] reports the kind
    /// of the wrapped failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ConfigInvalid { .. } => ErrorKind::ConfigInvalid,
            Error::ManifestShape { .. } => ErrorKind::ManifestShape,
            Error::NamespaceConflict { .. } => ErrorKind::NamespaceConflict,
            Error::SecretClusterUnreachable { .. } => ErrorKind::SecretClusterUnreachable,
            Error::SecretQueryFailed { .. } => ErrorKind::SecretQueryFailed,
            Error::SecretNotFound { .. } => ErrorKind::SecretNotFound,
            Error::PortConflict { .. } => ErrorKind::PortConflict,
            Error::CertMaterialMissing { .. } => ErrorKind::CertMaterialMissing,
            Error::KbsUnreachable { .. } => ErrorKind::KbsUnreachable,
            Error::UploadFailed { .. } => ErrorKind::UploadFailed,
            Error::PathTraversal { .. } => ErrorKind::PathTraversal,
            Error::NetworkBlocked { .. } => ErrorKind::NetworkBlocked,
            Error::DocumentTooLarge { .. } => ErrorKind::DocumentTooLarge,
            Error::YamlInvalid { .. } => ErrorKind::YamlInvalid,
            Error::Step { source, .. } => source.kind(),
        }
    }

    /// Attach the name of the pipeline step that raised this error.
    pub fn at_step(self, step: &'static str) -> Error {
        Error::Step {
            step,
            source: Box::new(self),
        }
    }

    pub(crate) fn manifest_shape(reason: impl Into<String>) -> Error {
        Error::ManifestShape {
            reason: reason.into(),
        }
    }

    pub(crate) fn config_invalid(reason: impl Into<String>) -> Error {
        Error::ConfigInvalid {
            reason: reason.into(),
        }
    }

    pub(crate) fn yaml_invalid(path: &Path, reason: impl ToString) -> Error {
        Error::YamlInvalid {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }

    /// A local file could not be produced or delivered.
    pub(crate) fn file_write(path: &Path, err: std::io::Error) -> Error {
        Error::UploadFailed {
            target: format!("file '{}'", path.display()),
            reason: err.to_string(),
        }
    }

    /// Display form for a secret used in query-failure messages.
    pub(crate) fn secret_resource(name: &str, namespace: &str) -> String {
        format!("secret '{name}' in namespace '{namespace}'")
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
