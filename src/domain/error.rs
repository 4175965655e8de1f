//! Domain error types.

/// Top-level error type for barsim.
#[derive(Debug, thiserror::Error)]
pub enum BarsimError {
    #[error("database error: {reason}")]
    Database { reason: String },

    #[error("database query error: {reason}")]
    DatabaseQuery { reason: String },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error("malformed observation for {symbol}: {reason}")]
    MalformedObservation { symbol: String, reason: String },

    #[error("malformed trade intent: {reason}")]
    MalformedIntent { reason: String },

    #[error(
        "insufficient position in {symbol}/{timeframe}: requested {requested}, held {held}"
    )]
    InsufficientPosition {
        symbol: String,
        timeframe: String,
        requested: i64,
        held: i64,
    },

    #[error("no {resolution} data for {symbols} in the requested window")]
    DataUnavailable { resolution: String, symbols: String },

    #[error("upstream feed disconnected: {reason}")]
    UpstreamDisconnected { reason: String },

    #[error("symbol metadata has not been loaded")]
    MetadataNotLoaded,

    #[error("unknown resolution '{0}'")]
    UnknownResolution(String),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BarsimError {
    /// Process exit status for this error class.
    pub fn exit_status(&self) -> u8 {
        match self {
            BarsimError::Io(_) | BarsimError::Csv(_) => 1,
            BarsimError::ConfigParse { .. }
            | BarsimError::ConfigMissing { .. }
            | BarsimError::ConfigInvalid { .. }
            | BarsimError::UnknownResolution(_) => 2,
            BarsimError::Database { .. }
            | BarsimError::DatabaseQuery { .. }
            | BarsimError::MetadataNotLoaded => 3,
            BarsimError::MalformedIntent { .. }
            | BarsimError::MalformedObservation { .. }
            | BarsimError::InsufficientPosition { .. } => 4,
            BarsimError::DataUnavailable { .. } => 5,
            BarsimError::UpstreamDisconnected { .. } => 6,
        }
    }
}

impl From<&BarsimError> for std::process::ExitCode {
    fn from(err: &BarsimError) -> Self {
        std::process::ExitCode::from(err.exit_status())
    }
}
