use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("no usable price available for {symbol}")]
    DataUnavailable { symbol: String },
    #[error("failed to persist forecast {id}: {message}")]
    PersistenceFailure { id: String, message: String },
    #[error("forecast computation failed: {0}")]
    ComputationError(String),
    #[error("forecast {id} is already resolved")]
    AlreadyResolved { id: String },
    #[error("forecast {id} has expired")]
    Expired { id: String },
    #[error("forecast {id} not found")]
    NotFound { id: String },
    #[error("price lookup for {symbol} timed out after {seconds}s")]
    Timeout { symbol: String, seconds: u64 },
}

impl CalibrationError {
    /// Finds a calibration error anywhere in an anyhow chain.
    pub fn find(error: &anyhow::Error) -> Option<&CalibrationError> {
        error
            .chain()
            .find_map(|cause| cause.downcast_ref::<CalibrationError>())
    }

    pub fn is_already_resolved(error: &anyhow::Error) -> bool {
        matches!(
            Self::find(error),
            Some(CalibrationError::AlreadyResolved { .. })
        )
    }

    pub fn is_expired(error: &anyhow::Error) -> bool {
        matches!(Self::find(error), Some(CalibrationError::Expired { .. }))
    }
}
