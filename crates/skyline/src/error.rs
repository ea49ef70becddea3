use std::path::PathBuf;

/// Hard failures of one pipeline invocation.
///
/// "Found nothing" outcomes (no buildings, no qualifying neighbours) are not
/// errors: they surface as an empty tileset or a `None` recommendation.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("degenerate geometry: {0}")]
    DegenerateGeometry(String),

    #[error("invalid height {0}: must be positive and finite")]
    InvalidHeight(f64),

    #[error("encoding overflow: {0}")]
    EncodingOverflow(String),

    #[error("failed to write {}: {source}", path.display())]
    IoWriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("tile bucket {0} has no encoded payload")]
    MissingPayload(usize),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PipelineError {
    pub(crate) fn degenerate(msg: impl Into<String>) -> Self {
        PipelineError::DegenerateGeometry(msg.into())
    }

    pub(crate) fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::IoWriteFailure {
            path: path.into(),
            source,
        }
    }

    /// Bad input polygon or height; retrying the same input will fail again.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            PipelineError::DegenerateGeometry(_) | PipelineError::InvalidHeight(_)
        )
    }
}

impl From<b3dm::EncodeError> for PipelineError {
    fn from(err: b3dm::EncodeError) -> Self {
        if err.is_overflow() {
            PipelineError::EncodingOverflow(err.to_string())
        } else {
            PipelineError::DegenerateGeometry(err.to_string())
        }
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
