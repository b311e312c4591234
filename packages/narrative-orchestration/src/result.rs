use crate::error::PipelineError;

/// Outcome of a stage (or any unit of work inside one).
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub enum StageResult<T> {
    Success(T),
    Failure(PipelineError),
    /// Usable value plus recoverable errors met along the way.
    Partial(T, Vec<PipelineError>),
}

impl<T> StageResult<T> {
    pub fn success(value: T) -> Self {
        Self::Success(value)
    }

    pub fn failure(error: impl Into<PipelineError>) -> Self {
        Self::Failure(error.into())
    }

    /// `Partial` when `errors` is non-empty, otherwise `Success`.
    pub fn partial(value: T, errors: Vec<PipelineError>) -> Self {
        if errors.is_empty() {
            Self::Success(value)
        } else {
            Self::Partial(value, errors)
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, Self::Partial(..))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Success(v) | Self::Partial(v, _) => Some(v),
            Self::Failure(_) => None,
        }
    }

    pub fn error(&self) -> Option<&PipelineError> {
        match self {
            Self::Failure(e) => Some(e),
            _ => None,
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> StageResult<U> {
        match self {
            Self::Success(v) => StageResult::Success(f(v)),
            Self::Failure(e) => StageResult::Failure(e),
            Self::Partial(v, errors) => StageResult::Partial(f(v), errors),
        }
    }

    /// Split into value and recoverable errors, or the failure.
    pub fn into_parts(self) -> Result<(T, Vec<PipelineError>), PipelineError> {
        match self {
            Self::Success(v) => Ok((v, Vec::new())),
            Self::Partial(v, errors) => Ok((v, errors)),
            Self::Failure(e) => Err(e),
        }
    }
}

impl<T, E: Into<PipelineError>> From<Result<T, E>> for StageResult<T> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(v) => Self::Success(v),
            Err(e) => Self::Failure(e.into()),
        }
    }
}
