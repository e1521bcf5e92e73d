//! Well-known error codes returned by the payjoin endpoint.
//!
//! The BIP78 codes are extended with the codes a merchant receiver uses to
//! explain invoice and wallet related rejections.
//! See: <https://github.com/bitcoin/bips/blob/master/bip-0078.mediawiki#receivers-well-known-errors>

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorCode {
    /// The payjoin endpoint is not available for now.
    Unavailable,
    /// The receiver added some inputs but could not bump the fee of the payjoin proposal.
    NotEnoughMoney,
    /// This version of payjoin is not supported.
    VersionUnsupported,
    /// The receiver rejected the original PSBT.
    OriginalPsbtRejected,
    /// The body is neither a PSBT nor a transaction.
    InvalidFormat,
    /// The original PSBT has non-finalized inputs.
    PsbtNotFinalized,
    /// Sender inputs are of mixed or unsupported script types.
    UnsupportedInputs,
    /// The original PSBT is internally inconsistent.
    InsanePsbt,
    /// The original fee rate cannot be computed without UTXO data.
    NeedUtxoInformation,
    /// The original PSBT carries xpubs or key paths.
    LeakingData,
    /// The original transaction would not be accepted by the mempool.
    InvalidTransaction,
    /// The receiver has no coin it can contribute right now.
    OutOfUtxos,
    /// The invoice already has a payment recorded.
    AlreadyPaid,
    /// No output pays a payjoin-enabled invoice.
    InvoiceNotFound,
    /// The payment output does not cover the amount due.
    InvoiceNotFullyPaid,
    /// Another request is coordinating the same inputs.
    InputsAlreadyUsed,
    /// The endpoint does not serve this network.
    InvalidNetwork,
}

impl ErrorCode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unavailable => "unavailable",
            Self::NotEnoughMoney => "not-enough-money",
            Self::VersionUnsupported => "version-unsupported",
            Self::OriginalPsbtRejected => "original-psbt-rejected",
            Self::InvalidFormat => "invalid-format",
            Self::PsbtNotFinalized => "psbt-not-finalized",
            Self::UnsupportedInputs => "unsupported-inputs",
            Self::InsanePsbt => "insane-psbt",
            Self::NeedUtxoInformation => "need-utxo-information",
            Self::LeakingData => "leaking-data",
            Self::InvalidTransaction => "invalid-transaction",
            Self::OutOfUtxos => "out-of-utxos",
            Self::AlreadyPaid => "already-paid",
            Self::InvoiceNotFound => "invoice-not-found",
            Self::InvoiceNotFullyPaid => "invoice-not-fully-paid",
            Self::InputsAlreadyUsed => "inputs-already-used",
            Self::InvalidNetwork => "invalid-network",
        }
    }

    /// The HTTP status this code is usually replied with.
    pub const fn default_status(&self) -> http::StatusCode {
        match self {
            Self::Unavailable => http::StatusCode::INTERNAL_SERVER_ERROR,
            Self::OutOfUtxos => http::StatusCode::SERVICE_UNAVAILABLE,
            Self::NotEnoughMoney | Self::AlreadyPaid => http::StatusCode::UNPROCESSABLE_ENTITY,
            Self::InvalidNetwork => http::StatusCode::NOT_FOUND,
            _ => http::StatusCode::BAD_REQUEST,
        }
    }
}

impl core::str::FromStr for ErrorCode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unavailable" => Ok(Self::Unavailable),
            "not-enough-money" => Ok(Self::NotEnoughMoney),
            "version-unsupported" => Ok(Self::VersionUnsupported),
            "original-psbt-rejected" => Ok(Self::OriginalPsbtRejected),
            "invalid-format" => Ok(Self::InvalidFormat),
            "psbt-not-finalized" => Ok(Self::PsbtNotFinalized),
            "unsupported-inputs" => Ok(Self::UnsupportedInputs),
            "insane-psbt" => Ok(Self::InsanePsbt),
            "need-utxo-information" => Ok(Self::NeedUtxoInformation),
            "leaking-data" => Ok(Self::LeakingData),
            "invalid-transaction" => Ok(Self::InvalidTransaction),
            "out-of-utxos" => Ok(Self::OutOfUtxos),
            "already-paid" => Ok(Self::AlreadyPaid),
            "invoice-not-found" => Ok(Self::InvoiceNotFound),
            "invoice-not-fully-paid" => Ok(Self::InvoiceNotFullyPaid),
            "inputs-already-used" => Ok(Self::InputsAlreadyUsed),
            "invalid-network" => Ok(Self::InvalidNetwork),
            _ => Err(()),
        }
    }
}

impl core::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn codes_round_trip_through_strings() {
        for code in [ErrorCode::OutOfUtxos, ErrorCode::LeakingData, ErrorCode::InvalidNetwork] {
            assert_eq!(ErrorCode::from_str(code.as_str()), Ok(code));
        }
        assert!(ErrorCode::from_str("nope").is_err());
    }

    #[test]
    fn retryable_codes_are_not_bad_requests() {
        assert_eq!(ErrorCode::OutOfUtxos.default_status().as_u16(), 503);
        assert_eq!(ErrorCode::AlreadyPaid.default_status().as_u16(), 422);
        assert_eq!(ErrorCode::InsanePsbt.default_status().as_u16(), 400);
    }
}
