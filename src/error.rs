use thiserror::Error;

/// Errors returned by fallible map operations.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No entry matches the requested key (or key-value pair).
    #[error("key not found")]
    KeyNotFound,

    /// The map has no entries.
    #[error("map is empty")]
    Empty,
}
