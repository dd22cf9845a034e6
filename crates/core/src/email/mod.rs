//! Trusted inbound mail: parsing, DKIM verification, the acceptance gate
//! and the handlers that act on accepted messages.

pub mod dkim;
pub mod form;
pub mod gate;
pub mod ingest;
pub mod message;
pub mod registration;

pub use dkim::{DkimVerifier, DnsOverHttpsResolver, KeyResolver, SignatureVerifier, StaticKeyResolver};
pub use gate::{AcceptedMessage, EmailGate, GatePolicy, GateStage, Rejection};
pub use ingest::{HandledMessage, IngestOutcome, IngestionService, MailHandler};
pub use message::RawMessage;
pub use registration::{RegistrationHandler, RegistrationTarget};
