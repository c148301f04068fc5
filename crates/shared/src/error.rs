use thiserror::Error;

/// A well-formedness violation for the declared envelope type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("{kind} envelope is missing required field `{field}`")]
    MissingField { kind: String, field: &'static str },
    #[error("{kind} envelope must not carry content")]
    UnexpectedContent { kind: String },
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error(transparent)]
    Invalid(#[from] EnvelopeError),
    #[error("failed to serialize envelope: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed envelope payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Invalid(#[from] EnvelopeError),
}
