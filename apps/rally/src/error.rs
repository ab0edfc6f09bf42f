use crate::directory::DirectoryError;
use crate::relay::RelayError;
use crate::session::SessionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Session(#[from] SessionError),
    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),
    #[error("session negotiation ended before the relay join completed")]
    NegotiationFailed,
    #[error("logging initialization failed: {0}")]
    Logging(String),
}
