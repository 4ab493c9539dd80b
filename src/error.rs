use thiserror::Error;

/// Failures raised by the command, register and data-block codecs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RhdError {
    #[error("{parameter} out of range: {value}")]
    OutOfRange { parameter: &'static str, value: f64 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("USB header sync lost in block {block} at sample {sample} (found {found:#018x})")]
    SyncLost {
        block: usize,
        sample: usize,
        found: u64,
    },
}

impl RhdError {
    pub(crate) fn out_of_range(parameter: &'static str, value: impl Into<f64>) -> Self {
        RhdError::OutOfRange {
            parameter,
            value: value.into(),
        }
    }
}

pub type Result<T, E = RhdError> = std::result::Result<T, E>;
