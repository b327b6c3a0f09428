use datafusion::{arrow::error::ArrowError, error::DataFusionError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("DataFusion: {0}")]
    DataFusion(#[from] DataFusionError),

    #[error("Arrow: {0}")]
    Arrow(#[from] ArrowError),

    #[error("CDW query failed: {0}")]
    Cdw(#[from] sqlx::Error),

    #[error("CDW connection is already closed")]
    ConnectionClosed,

    #[error("UDW request failed: {0}")]
    UdwRequest(#[from] reqwest::Error),

    #[error("UDW statement failed with code {code}: {message}")]
    Statement { code: String, message: String },

    #[error("Unexpected UDW response: {message}")]
    UnexpectedResponse { message: String },

    #[error("Failed to parse URL: {0}")]
    UrlParsingFailed(#[from] url::ParseError),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("Failed to parse config file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("No {kind} profile named '{name}' in the config file")]
    ProfileNotFound { kind: &'static str, name: String },

    #[error("Invalid region supplied: '{region}'")]
    InvalidRegion { region: String },

    #[error("Invalid country code: '{country}'")]
    InvalidCountry { country: String },

    #[error("'{identifier}' is not a valid SQL identifier")]
    InvalidIdentifier { identifier: String },

    #[error("The start date: '{start_date}' is greater than the end date: '{end_date}'")]
    StartDateAfterEndDate {
        start_date: String,
        end_date: String,
    },

    #[error("Another run holds the lock at {path}")]
    LockHeld { path: String },
}
