//! Receive Payjoin
//!
//! The receiver matches an original transaction to an invoice, contributes
//! one of the merchant wallet's coins, keeps the original fee rate, and
//! records the payment before returning the proposal.
//!
//! [`PayjoinEndpoint::submit`] runs the whole exchange for one request. The
//! endpoint owns the [`UtxoLocks`] and [`PayjoinStateProvider`] shared by
//! concurrent requests; run a [`StaleRebroadcaster`] next to it so originals
//! of abandoned payjoins still reach the chain.

mod broadcast;
mod endpoint;
mod error;
mod lock;
mod optional_parameters;
mod proposal;
mod request;
mod selection;
mod sign;
mod state;
mod wallet;

pub use broadcast::{
    DelayedBroadcaster, StaleRebroadcaster, DEFAULT_BROADCAST_DELAY, DEFAULT_REBROADCAST_INTERVAL,
    DEFAULT_STALE_TIMEOUT,
};
pub use endpoint::{EndpointConfig, PayjoinEndpoint, PayjoinProposal};
pub use error::{Error, JsonReply, RequestError};
pub use lock::UtxoLocks;
pub use request::{BodyFormat, Headers, OriginalRequest};
pub use selection::UtxoOrdering;
pub use state::{OriginalConflict, PayjoinState, PayjoinStateProvider, RecordedItem};
pub use wallet::{
    tracking_key, BroadcastResult, ChainPaymentMethod, DerivationScheme, Explorer,
    InvoiceRepository, PayjoinInformation, PaymentRecord, ReceivedCoin, ScriptType,
    UnknownScriptType, PAYJOIN_CONFIRMATION_SENTINEL,
};
