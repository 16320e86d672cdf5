//! Domain errors callers branch on. Everything else travels as `anyhow::Error`.

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The backend answered but the body carried no usable completion.
    #[error("generation request failed: {0}")]
    Generation(String),
    #[error("archive template '{0}' not found")]
    TemplateNotFound(String),
    #[error("archive template '{0}' is missing the {{{{log}}}} placeholder")]
    InvalidTemplate(String),
    #[error("database connection lock poisoned")]
    LockPoisoned,
    #[error("unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },
}
