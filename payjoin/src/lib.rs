//! # Payjoin receiver for invoice-based payment processing
//!
//! Implements the receiving side of [BIP 78 Payjoin](https://github.com/bitcoin/bips/blob/master/bip-0078.mediawiki)
//! for a merchant whose invoices are tracked by deposit address: the sender's
//! original transaction is matched to an invoice, the receiver contributes one
//! of its own coins while preserving the original fee rate, and the payment is
//! recorded before the new proposal is returned.
//!
//! The library is IO-agnostic. Wallet, chain and invoice access go through the
//! [`receive::Explorer`] and [`receive::InvoiceRepository`] traits, and HTTP
//! requests are consumed through [`receive::Headers`] and a byte body.

pub extern crate bitcoin;

pub mod receive;

pub(crate) mod error_codes;
pub(crate) mod psbt;

pub use error_codes::ErrorCode;

/// Errors raised by wallet, chain or database implementations behind the
/// receiver's collaborator traits.
pub type ImplementationError = Box<dyn std::error::Error + Send + Sync>;

/// 4M block size limit with base64 encoding overhead => maximum reasonable size of content-length
/// 4_000_000 * 4 / 3 fits in u32
pub const MAX_CONTENT_LENGTH: usize = 4_000_000 * 4 / 3;
