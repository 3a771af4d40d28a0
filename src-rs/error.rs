use thiserror::Error;

pub type Result<T> = std::result::Result<T, GuideError>;

/// Failures that end a request (or a whole session, for configuration).
///
/// Expected branches such as a malformed model reply, a rejected action token or an
/// empty detection pass are modelled as outcome types and never reach this enum
/// unless their retry budgets are exhausted.
#[derive(Debug, Error)]
pub enum GuideError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("instruction parser returned malformed output {attempts} times in a row")]
    ParseFailure { attempts: u32, last_output: String },

    #[error("no valid action after {rounds} parse rounds (last rejected token: {token:?})")]
    InvalidAction { rounds: u32, token: String },

    #[error("instruction ordinal {ordinal} is out of range ({count} instructions loaded)")]
    UnknownOrdinal { ordinal: usize, count: usize },

    #[error("detector failed: {0}")]
    Detector(String),

    #[error("vision-language backend failed: {0}")]
    Backend(String),

    #[error("instruction store error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl GuideError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}
