//! Error types for minion-call.
//!
//! Two tiers: [`Error`] and [`DispatchError`] fail a call (or the rest of
//! it), while [`CallError`] is a terminal value of one worker's result and
//! never leaves that worker's slot.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The remote side refused to start a job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("rejected by master: {0}")]
    Rejected(String),
}

/// Why a single worker's slot resolved to a failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("decoding error: {0}")]
    Decoding(#[from] DecodingError),

    #[error("function '{function}' is not available on this minion")]
    FunctionNotAvailable { function: String },

    #[error("canceled: {0}")]
    Canceled(String),
}

/// A worker's return value did not match the expected shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{detail} at path {path}")]
pub struct DecodingError {
    /// Location of the mismatch, `$` being the return value itself.
    pub path: String,
    /// What was actually found at `path`.
    pub observed: crate::decode::JsonKind,
    /// The deserializer's description, naming the expected shape.
    pub detail: String,
}

/// Outcome of one worker within one job.
pub type CallResult<T> = std::result::Result<T, CallError>;
