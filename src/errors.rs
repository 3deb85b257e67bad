use thiserror::Error;

/// The central error type for content-sync.
///
/// Mutation-path failures reach callers through this type only after the
/// optimistic change has been rolled back.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("No record matches identity '{identity}'")]
    IdentityNotFound { identity: String },

    #[error("Invalid mutation transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("API request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("API returned status {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("API returned an HTML error page (status {status})")]
    HtmlErrorPage { status: u16 },

    #[error("Failed to parse API response: {0}")]
    Parse(String),

    #[error("Invalid request URL: {0}")]
    InvalidUrl(String),
}

impl ApiError {
    /// Whether a retry of the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Timeout | ApiError::Network(_) | ApiError::HtmlErrorPage { .. } => true,
            ApiError::HttpStatus { status, .. } => (500..600).contains(status),
            ApiError::Parse(_) | ApiError::InvalidUrl(_) => false,
        }
    }

    /// HTTP status attached to the error, if the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::HttpStatus { status, .. } | ApiError::HtmlErrorPage { status } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::Timeout
        } else if e.is_decode() {
            ApiError::Parse(e.to_string())
        } else if e.is_builder() {
            ApiError::InvalidUrl(e.to_string())
        } else {
            ApiError::Network(e.to_string())
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Failed to connect to notification channel: {0}")]
    Connect(String),

    #[error("Notification channel connect timed out")]
    Timeout,

    #[error("Failed to send on notification channel: {0}")]
    Send(String),

    #[error("Malformed notification: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_ERROR: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_API_ERROR: u8 = 4;
pub const EXIT_CHANNEL_ERROR: u8 = 5;
pub const EXIT_IDENTITY_ERROR: u8 = 6;

/// Determine the appropriate process exit code for an error.
pub fn get_exit_code(e: &anyhow::Error) -> u8 {
    if let Some(sync_err) = e.downcast_ref::<SyncError>() {
        return match sync_err {
            SyncError::Config(_) => EXIT_CONFIG_ERROR,
            SyncError::Api(_) => EXIT_API_ERROR,
            SyncError::Channel(_) => EXIT_CHANNEL_ERROR,
            SyncError::IdentityNotFound { .. } => EXIT_IDENTITY_ERROR,
            _ => EXIT_ERROR,
        };
    }

    // Direct enum unwraps fallback
    if e.downcast_ref::<ApiError>().is_some() {
        return EXIT_API_ERROR;
    }
    if e.downcast_ref::<ChannelError>().is_some() {
        return EXIT_CHANNEL_ERROR;
    }

    EXIT_ERROR
}
