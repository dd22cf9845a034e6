//! Error types for the rostersync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Authentication(#[from] AuthenticationError),

    #[error(transparent)]
    Api(#[from] ApiRequestError),

    #[error(transparent)]
    Translation(#[from] TranslationError),

    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    Notification(#[from] NotificationError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    /// A mail handler could not finish processing an accepted message.
    #[error("mail handler failed: {0}")]
    Handler(String),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// A command referenced a platform that is not configured.
    #[error("platform '{0}' is not configured")]
    UnknownPlatform(String),

    /// A platform lacks the endpoint block an operation needs.
    #[error("platform '{platform}' has no [{section}] endpoint configured")]
    MissingEndpoint { platform: String, section: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Schema errors
// ---------------------------------------------------------------------------

/// Errors while loading the field-translation table. Any of these aborts the
/// run: a partial schema is never used.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// The table could not be downloaded.
    #[error("failed to fetch translation table: {0}")]
    Fetch(#[from] ApiRequestError),

    /// The table body could not be parsed.
    #[error("translation table parse error: {0}")]
    Parse(String),

    /// The header row lacks the canonical key column.
    #[error("translation table has no '{0}' column")]
    MissingKeyColumn(String),

    /// Two rows map the same name to different counterparts.
    #[error("conflicting translation in column '{system}': '{name}' maps to both '{first}' and '{second}'")]
    Conflict {
        system: String,
        name: String,
        first: String,
        second: String,
    },

    /// No column exists for the requested system.
    #[error("translation table has no column for system '{0}'")]
    UnknownSystem(String),

    /// The sheet URL did not contain a spreadsheet id.
    #[error("not a spreadsheet URL: {0}")]
    InvalidUrl(String),
}

// ---------------------------------------------------------------------------
// Authentication / API errors
// ---------------------------------------------------------------------------

/// Missing or rejected credentials. Raised before any data is read.
#[derive(Debug, Error)]
pub enum AuthenticationError {
    /// The environment variable holding the credential is not set.
    #[error("no credential for platform '{platform}' (set ${env_var})")]
    MissingCredential { platform: String, env_var: String },

    /// The platform refused the credential.
    #[error("platform '{platform}' rejected the credential (HTTP {status})")]
    Rejected { platform: String, status: u16 },
}

/// A failed request against an external system.
#[derive(Debug, Error)]
pub enum ApiRequestError {
    /// HTTP-level transport error (network, TLS, etc.).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The API returned a non-success status code.
    #[error("{method} {url} failed (HTTP {status}): {body}")]
    Status {
        method: String,
        url: String,
        status: u16,
        body: String,
    },

    /// The response body did not have the expected shape.
    #[error("unexpected response from {url}: {detail}")]
    Decode { url: String, detail: String },

    /// The platform has no endpoint configured for the operation.
    #[error("platform '{platform}' does not support {operation}")]
    Unsupported { platform: String, operation: String },
}

impl ApiRequestError {
    /// HTTP status of the failed call, if the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            Self::Decode { .. } | Self::Unsupported { .. } => None,
        }
    }

    /// Whether the failure was an authentication rejection.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self.status(), Some(401) | Some(403))
    }
}

// ---------------------------------------------------------------------------
// Translation errors
// ---------------------------------------------------------------------------

/// Errors translating canonical records back to an external system.
///
/// Fatal for the affected operation only; the rest of the pass goes on.
#[derive(Debug, Error)]
pub enum TranslationError {
    /// A canonical key has no column for the target system.
    #[error("missing translation for '{key}' to {system} field")]
    MissingField { system: String, key: String },

    /// A create carries fields the target cannot store and there is no
    /// notes field to fold them into.
    #[error("{system} has no notes field for untranslated fields {fields:?}")]
    NoNotesField { system: String, fields: Vec<String> },

    /// Two dotted keys collide while rebuilding a nested record.
    #[error("path conflict at '{0}' while rebuilding nested record")]
    PathConflict(String),
}

// ---------------------------------------------------------------------------
// Email gate errors
// ---------------------------------------------------------------------------

/// Reasons an inbound message is rejected by the ingestion gate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerificationError {
    /// The raw message could not be parsed.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Signature missing, unparseable, or cryptographically invalid.
    #[error("signature verification failed: {0}")]
    SignatureInvalid(String),

    /// The signing key could not be obtained.
    #[error("signing key unavailable for '{0}'")]
    KeyUnavailable(String),

    /// A header that must be covered by the signature is not.
    #[error("header '{0}' is not covered by the signature")]
    HeaderNotSigned(String),

    /// The true sender could not be determined.
    #[error("cannot determine sender: {0}")]
    SenderUnresolved(String),

    /// Sender domain differs from the signing domain.
    #[error("sender domain '{sender_domain}' does not match signing domain '{signing_domain}'")]
    DomainMismatch {
        sender_domain: String,
        signing_domain: String,
    },

    /// The signing domain is not in the allowed domain set.
    #[error("signing domain '{0}' is not allowed")]
    DomainNotAllowed(String),

    /// A header that may occur once appears several times.
    #[error("header '{0}' appears more than once")]
    DuplicateHeader(String),

    /// The From header does not match the configured pattern.
    #[error("From header '{0}' does not match the allowed pattern")]
    FromPatternMismatch(String),

    /// The receiving server's Authentication-Results verdict is missing or
    /// not a pass.
    #[error("receiving server verdict: {0}")]
    AuthenticationResults(String),

    /// The sender is not in the authorized address list.
    #[error("sender '{0}' is not authorized")]
    SenderNotAllowed(String),

    /// Auto-replies and other machine-generated mail are refused.
    #[error("auto-generated message ({0} header present)")]
    AutoGenerated(String),

    /// The Date header is absent.
    #[error("message has no Date header")]
    DateMissing,

    /// The Date header could not be parsed.
    #[error("unparseable Date header '{0}'")]
    DateUnparseable(String),

    /// The message claims to be from the future.
    #[error("message dated {0} is in the future")]
    DateInFuture(String),

    /// The message is older than the replay window.
    #[error("message dated {0} is older than the accepted age")]
    DateTooOld(String),

    /// No delivery address could be resolved.
    #[error("no delivery address found")]
    NoDeliveryAddress,

    /// No handler is registered for the delivery address.
    #[error("no handler for delivery address '{0}'")]
    UnknownRecipient(String),
}

// ---------------------------------------------------------------------------
// Applicator errors
// ---------------------------------------------------------------------------

/// Errors from applying planned changes to a target system.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The mark phase failed; nothing was written.
    #[error("mark phase failed for record set '{record_set}': {source}")]
    MarkFailed {
        record_set: String,
        #[source]
        source: ApiRequestError,
    },

    /// The logical record-set name is not a plain identifier.
    #[error("invalid record set name '{0}'")]
    InvalidRecordSet(String),

    /// The target rejected a write.
    #[error(transparent)]
    Api(#[from] ApiRequestError),
}

// ---------------------------------------------------------------------------
// Notification errors
// ---------------------------------------------------------------------------

/// Errors from the notification subsystem (Slack, email).
#[derive(Debug, Error)]
pub enum NotificationError {
    /// Slack webhook delivery failed.
    #[error("Slack notification failed: {0}")]
    SlackError(String),

    /// Email delivery failed.
    #[error("email notification failed: {0}")]
    EmailError(String),

    /// HTTP error during notification delivery.
    #[error("notification HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// All notification channels failed.
    #[error("all notification channels failed: {0}")]
    AllChannelsFailed(String),
}

// ---------------------------------------------------------------------------
// Cache errors
// ---------------------------------------------------------------------------

/// Errors from the best-effort disk cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache entry could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = TranslationError::MissingField {
            system: "Conscribo".into(),
            key: "pronouns".into(),
        };
        assert_eq!(
            err.to_string(),
            "missing translation for 'pronouns' to Conscribo field"
        );

        let err = VerificationError::DomainMismatch {
            sender_domain: "mail.example.org".into(),
            signing_domain: "example.org".into(),
        };
        assert!(err.to_string().contains("mail.example.org"));

        let err = AuthenticationError::MissingCredential {
            platform: "laposta".into(),
            env_var: "LAPOSTA_KEY".into(),
        };
        assert!(err.to_string().contains("LAPOSTA_KEY"));
    }

    #[test]
    fn test_api_error_status() {
        let err = ApiRequestError::Status {
            method: "GET".into(),
            url: "https://api.example.org/x".into(),
            status: 403,
            body: "forbidden".into(),
        };
        assert_eq!(err.status(), Some(403));
        assert!(err.is_auth_failure());
        assert!(err.to_string().contains("forbidden"));
    }

    #[test]
    fn test_core_error_from_subsystem() {
        let err: CoreError = VerificationError::DateMissing.into();
        assert!(matches!(err, CoreError::Verification(_)));

        let err: CoreError = SchemaError::UnknownSystem("Grist".into()).into();
        assert!(matches!(err, CoreError::Schema(_)));
    }
}
