use std::fmt;

use payjoin::bitcoin::consensus::encode;

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure to read or write the invoice store.
#[derive(Debug)]
pub enum Error {
    Sqlite(rusqlite::Error),
    Pool(r2d2::Error),
    /// The stored payjoin information is not the JSON we wrote.
    PayjoinJson(serde_json::Error),
    /// A stored outpoint or output does not decode.
    Decode(encode::Error),
    /// A stored value no longer parses into its domain type.
    Corrupt(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Sqlite(e) => write!(f, "invoice store query failed: {e}"),
            Error::Pool(e) => write!(f, "no invoice store connection available: {e}"),
            Error::PayjoinJson(e) => write!(f, "unreadable payjoin record: {e}"),
            Error::Decode(e) => write!(f, "undecodable payment record: {e}"),
            Error::Corrupt(what) => write!(f, "corrupt invoice record: {what}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Sqlite(e) => Some(e),
            Error::Pool(e) => Some(e),
            Error::PayjoinJson(e) => Some(e),
            Error::Decode(e) => Some(e),
            Error::Corrupt(_) => None,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(error: rusqlite::Error) -> Self { Error::Sqlite(error) }
}

impl From<r2d2::Error> for Error {
    fn from(error: r2d2::Error) -> Self { Error::Pool(error) }
}

impl From<encode::Error> for Error {
    fn from(error: encode::Error) -> Self { Error::Decode(error) }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self { Error::PayjoinJson(error) }
}
