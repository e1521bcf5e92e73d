use std::io::Read;
use std::str::FromStr;

use bitcoin::consensus::encode::{deserialize_hex, serialize_hex};
use bitcoin::hex::{DisplayHex, FromHex};
use bitcoin::psbt::Psbt;
use bitcoin::Transaction;

use super::error::{InternalRequestError, RequestError};
use super::optional_parameters::Params;
use crate::MAX_CONTENT_LENGTH;

const SUPPORTED_CONTENT_TYPE: &str = "text/plain";

pub trait Headers {
    fn get_header(&self, key: &str) -> Option<&str>;
}

/// How the sender encoded the original, so the proposal goes back the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFormat {
    Base64Psbt,
    HexPsbt,
    RawTransaction,
}

impl BodyFormat {
    pub(crate) fn encode(&self, psbt: &Psbt) -> String {
        match self {
            BodyFormat::Base64Psbt => psbt.to_string(),
            BodyFormat::HexPsbt => psbt.serialize().to_lower_hex_string(),
            BodyFormat::RawTransaction => serialize_hex(&psbt.clone().extract_tx_unchecked_fee_rate()),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum OriginalPayload {
    Psbt(Psbt),
    Transaction(Transaction),
}

/// A request body and query that passed the HTTP level checks.
#[derive(Debug, Clone)]
pub struct OriginalRequest {
    pub(crate) payload: OriginalPayload,
    pub(crate) format: BodyFormat,
    pub(crate) params: Params,
}

impl OriginalRequest {
    pub fn from_request(
        mut body: impl Read,
        query: &str,
        headers: impl Headers,
    ) -> Result<Self, RequestError> {
        let content_type = headers
            .get_header("Content-Type")
            .ok_or(InternalRequestError::MissingHeader("Content-Type"))?;
        if !content_type.starts_with(SUPPORTED_CONTENT_TYPE) {
            return Err(InternalRequestError::InvalidContentType(content_type.to_owned()).into());
        }
        let content_length = headers
            .get_header("Content-Length")
            .ok_or(InternalRequestError::MissingHeader("Content-Length"))?
            .parse::<usize>()
            .map_err(InternalRequestError::InvalidContentLength)?;
        if content_length > MAX_CONTENT_LENGTH {
            return Err(InternalRequestError::ContentLengthTooLarge(content_length).into());
        }

        let mut buf = vec![0; content_length];
        body.read_exact(&mut buf).map_err(InternalRequestError::Io)?;
        let text = std::str::from_utf8(&buf).map_err(InternalRequestError::Utf8)?.trim();
        let (payload, format) = parse_body(text).ok_or(InternalRequestError::UnknownFormat)?;
        log::debug!("Received original as {format:?}");

        let pairs = url::form_urlencoded::parse(query.as_bytes());
        let params = Params::from_query_pairs(pairs).map_err(InternalRequestError::SenderParams)?;
        log::debug!("Received request with params: {params:?}");

        Ok(OriginalRequest { payload, format, params })
    }

    pub fn format(&self) -> BodyFormat { self.format }
}

fn parse_body(text: &str) -> Option<(OriginalPayload, BodyFormat)> {
    if let Ok(psbt) = Psbt::from_str(text) {
        return Some((OriginalPayload::Psbt(psbt), BodyFormat::Base64Psbt));
    }
    let bytes = Vec::<u8>::from_hex(text).ok()?;
    if let Ok(psbt) = Psbt::deserialize(&bytes) {
        return Some((OriginalPayload::Psbt(psbt), BodyFormat::HexPsbt));
    }
    deserialize_hex::<Transaction>(text)
        .ok()
        .map(|tx| (OriginalPayload::Transaction(tx), BodyFormat::RawTransaction))
}
