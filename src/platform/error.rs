//! Crate-wide error types.

use thiserror::Error;

pub type BridgeResult<T> = Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("call sites {first} and {second} both flatten to key {key:?}")]
    KeyCollision {
        key: String,
        first: String,
        second: String,
    },

    #[error("worker error: {0}")]
    Worker(String),
}

/// Errors raised while reading a stored profiling report.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("cannot read report: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected end of data at offset {offset} ({wanted} more bytes needed)")]
    Truncated { offset: usize, wanted: usize },

    #[error("unknown marshal type code {code:#04x} at offset {offset}")]
    UnknownType { code: u8, offset: usize },

    #[error("unexpected NULL marker at offset {offset}")]
    UnexpectedNull { offset: usize },

    #[error("invalid back-reference {index} at offset {offset}")]
    BadReference { index: u32, offset: usize },

    #[error("negative length {length} at offset {offset}")]
    NegativeLength { length: i32, offset: usize },

    #[error("invalid utf-8 text at offset {offset}: {source}")]
    InvalidText {
        offset: usize,
        #[source]
        source: std::str::Utf8Error,
    },

    #[error("invalid float literal at offset {offset}")]
    InvalidFloat { offset: usize },

    #[error("integer at offset {offset} does not fit in 64 bits")]
    IntegerOverflow { offset: usize },

    #[error("nesting deeper than {limit} levels at offset {offset}")]
    TooDeep { limit: usize, offset: usize },

    #[error("{count} trailing bytes after the report")]
    TrailingData { count: usize },

    #[error("not a profiling report: {0}")]
    Shape(String),
}
