use std::time;

use thiserror::Error;

/// Enumeration of errors on the link to the device. All of them end the current connection
/// attempt and lead to a reconnect.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to reach the device: {0}")]
    ConnectError(reqwest::Error),
    #[error("device did not answer within {0:?}")]
    ConnectTimeout(time::Duration),
    #[error("device could not be authenticated: {0}")]
    AuthError(String),
    #[error("device answered with unexpected status {0}")]
    UnexpectedStatus(http::StatusCode),
    #[error("device answered with content type {0:?}, expected multipart with a boundary")]
    MissingBoundary(String),
    #[error("reading from the alert stream failed: {0}")]
    ReadError(String),
}

/// The device kept the connection open but sent nothing for too long.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("no data received from the device for {0:?}")]
pub struct StallFailure(pub time::Duration);

/// Enumeration of errors related to initialization of the worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("invalid device or webhook url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("failed to build an http client: {0}")]
    HttpClientError(#[from] reqwest::Error),
}
