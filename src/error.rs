use thiserror::Error;

/// Errors surfaced by the log engine.
///
/// Validation errors carry fixed, user-facing messages and are returned
/// synchronously; upstream store errors are propagated unchanged; cache
/// refresh errors are logged by the refresh task and never reach a request.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid chart type")]
    InvalidChartType,

    #[error("slice by field is required")]
    MissingSliceBy,

    #[error("invalid size by operation")]
    InvalidSizeByOperation,

    #[error("horizontal axis field is required")]
    MissingHorizontalAxisField,

    #[error("vertical axis field is required")]
    MissingVerticalAxisField,

    #[error("invalid vertical axis operation")]
    InvalidVerticalAxisOperation,

    #[error("invalid time range")]
    InvalidTimeRange,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("query failed: {0}")]
    Upstream(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("filter compilation failed: {0}")]
    Filter(String),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Connection(err.to_string())
    }
}
