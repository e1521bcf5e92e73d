use std::{error, fmt};

use crate::error_codes::ErrorCode::{
    self, InvalidFormat, OriginalPsbtRejected, Unavailable, VersionUnsupported,
};

/// The top-level error type for the payjoin receiver
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The original request was refused. The reply is meant for the sender.
    Rejected(JsonReply),
    /// Error arising due to the specific receiver implementation
    ///
    /// e.g. database errors, network failures, wallet errors
    Implementation(crate::ImplementationError),
}

impl Error {
    pub(crate) fn rejected(error_code: ErrorCode, message: impl fmt::Display) -> Self {
        Error::Rejected(JsonReply::new(error_code, message))
    }

    /// The reply to send back to the sender for this error.
    pub fn reply(&self) -> JsonReply { self.into() }
}

impl From<&Error> for JsonReply {
    fn from(e: &Error) -> Self {
        match e {
            Error::Rejected(reply) => reply.clone(),
            Error::Implementation(_) => JsonReply::new(Unavailable, "Receiver error"),
        }
    }
}

impl From<JsonReply> for Error {
    fn from(reply: JsonReply) -> Self { Error::Rejected(reply) }
}

impl From<RequestError> for Error {
    fn from(e: RequestError) -> Self { Error::Rejected((&e).into()) }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Rejected(reply) => write!(f, "Rejected ({}): {}", reply.error_code, reply.message),
            Error::Implementation(e) => write!(f, "Implementation error: {e}"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Rejected(_) => None,
            Error::Implementation(e) => Some(e.as_ref()),
        }
    }
}

/// The standard format for errors that can be replied as JSON.
///
/// The JSON output includes the following fields:
/// ```json
/// {
///     "httpCode": 400,
///     "errorCode": "specific-error-code",
///     "message": "Human readable error message"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonReply {
    http_code: u16,
    error_code: ErrorCode,
    message: String,
    /// Additional fields to be included in the JSON response
    extra: serde_json::Map<String, serde_json::Value>,
}

impl JsonReply {
    /// Create a new Reply with the usual status of `error_code`
    pub(crate) fn new(error_code: ErrorCode, message: impl fmt::Display) -> Self {
        Self {
            http_code: error_code.default_status().as_u16(),
            error_code,
            message: message.to_string(),
            extra: serde_json::Map::new(),
        }
    }

    pub(crate) fn with_status(mut self, status: http::StatusCode) -> Self {
        self.http_code = status.as_u16();
        self
    }

    /// Add an additional field to the JSON response
    pub fn with_extra(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    /// Serialize the Reply to a JSON value
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert("httpCode".to_string(), self.http_code.into());
        map.insert("errorCode".to_string(), self.error_code.to_string().into());
        map.insert("message".to_string(), self.message.clone().into());
        map.extend(self.extra.clone());

        serde_json::Value::Object(map)
    }

    /// Get the HTTP status code for the error
    pub fn status_code(&self) -> u16 { self.http_code }

    pub fn error_code(&self) -> ErrorCode { self.error_code }

    pub fn message(&self) -> &str { &self.message }
}

/// Error that may occur when the request from sender is malformed.
///
/// This is currently opaque type because we aren't sure which variants will stay.
/// You can only display it.
#[derive(Debug)]
pub struct RequestError(InternalRequestError);

#[derive(Debug)]
pub(crate) enum InternalRequestError {
    Io(std::io::Error),
    MissingHeader(&'static str),
    InvalidContentType(String),
    InvalidContentLength(std::num::ParseIntError),
    ContentLengthTooLarge(usize),
    Utf8(std::str::Utf8Error),
    /// The body is neither a PSBT nor a transaction
    UnknownFormat,
    SenderParams(super::optional_parameters::Error),
}

impl RequestError {
    /// The body turned out longer than `limit` while being read.
    pub fn body_too_large(limit: usize) -> Self {
        RequestError(InternalRequestError::ContentLengthTooLarge(limit))
    }
}

impl From<InternalRequestError> for RequestError {
    fn from(value: InternalRequestError) -> Self { RequestError(value) }
}

impl From<&RequestError> for JsonReply {
    fn from(e: &RequestError) -> Self {
        use InternalRequestError::*;

        match &e.0 {
            MissingHeader("Content-Length") | InvalidContentLength(_) =>
                JsonReply::new(OriginalPsbtRejected, e)
                    .with_status(http::StatusCode::LENGTH_REQUIRED),
            ContentLengthTooLarge(_) => JsonReply::new(OriginalPsbtRejected, e)
                .with_status(http::StatusCode::PAYLOAD_TOO_LARGE),
            InvalidContentType(_) | MissingHeader(_) | Utf8(_) | UnknownFormat =>
                JsonReply::new(InvalidFormat, e),
            SenderParams(super::optional_parameters::Error::UnknownVersion { supported_versions }) =>
                JsonReply::new(VersionUnsupported, "This version of payjoin is not supported.")
                    .with_extra("supported", supported_versions.to_vec()),
            SenderParams(_) | Io(_) => JsonReply::new(OriginalPsbtRejected, e),
        }
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.0 {
            InternalRequestError::Io(e) => write!(f, "Failed to read the request body: {e}"),
            InternalRequestError::MissingHeader(header) => write!(f, "Missing header: {header}"),
            InternalRequestError::InvalidContentType(content_type) =>
                write!(f, "Invalid content type: {content_type}"),
            InternalRequestError::InvalidContentLength(e) =>
                write!(f, "Invalid content length: {e}"),
            InternalRequestError::ContentLengthTooLarge(length) =>
                write!(f, "Content length too large: {length}."),
            InternalRequestError::Utf8(e) => write!(f, "The body is not UTF-8: {e}"),
            InternalRequestError::UnknownFormat =>
                write!(f, "The body is neither a PSBT nor a transaction."),
            InternalRequestError::SenderParams(e) => write!(f, "Invalid sender parameters: {e}"),
        }
    }
}

impl std::error::Error for RequestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.0 {
            InternalRequestError::Io(e) => Some(e),
            InternalRequestError::InvalidContentLength(e) => Some(e),
            InternalRequestError::Utf8(e) => Some(e),
            InternalRequestError::SenderParams(e) => Some(e),
            _ => None,
        }
    }
}

/// The request was dropped before the coordinator finished.
#[derive(Debug)]
pub(crate) struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { write!(f, "request cancelled") }
}

impl std::error::Error for Cancelled {}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn reply_carries_the_http_code() {
        let reply = JsonReply::new(ErrorCode::OutOfUtxos, "no coins");
        assert_eq!(
            reply.to_json(),
            json!({ "httpCode": 503, "errorCode": "out-of-utxos", "message": "no coins" })
        );
    }

    #[test]
    fn missing_content_length_is_411() {
        let error = RequestError::from(InternalRequestError::MissingHeader("Content-Length"));
        let reply = JsonReply::from(&error);
        assert_eq!(reply.status_code(), 411);
        assert_eq!(reply.error_code(), ErrorCode::OriginalPsbtRejected);

        let error = RequestError::from(InternalRequestError::ContentLengthTooLarge(usize::MAX));
        assert_eq!(JsonReply::from(&error).status_code(), 413);

        let reply = Error::from(RequestError::body_too_large(10)).reply();
        assert_eq!(reply.status_code(), 413);
        assert_eq!(reply.error_code(), ErrorCode::OriginalPsbtRejected);
    }

    #[test]
    fn implementation_errors_are_hidden() {
        let error = Error::Implementation("database exploded".into());
        let json = error.reply().to_json();
        assert_eq!(json["errorCode"], "unavailable");
        assert_eq!(json["httpCode"], 500);
        assert_eq!(json["message"], "Receiver error");
    }
}
