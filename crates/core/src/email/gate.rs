//! The trusted-mail gate: every inbound message either comes out as an
//! [`AcceptedMessage`] or as a [`Rejection`] naming the failed stage.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Duration, FixedOffset, Utc};
use regex_lite::Regex;
use serde::Serialize;
use tracing::{info, instrument, warn};

use super::dkim::{SignatureVerifier, VerifiedSignature};
use super::message::{domain_of, parse_addresses, parse_date, RawMessage};
use crate::config::GateConfig;
use crate::errors::{ConfigError, VerificationError};

static RECEIVED_FOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bfor\s+<([^>\s]+)>").expect("static regex is valid")
});

/// Headers that must always be signed.
const REQUIRED_SIGNED: &[&str] = &["from", "to", "subject", "date"];
/// Headers that must be signed when present.
const SIGNED_IF_PRESENT: &[&str] = &["sender", "message-id", "reply-to"];
/// Headers RFC 5322 allows at most once. A second, unsigned instance
/// could otherwise shadow the signed one.
const SINGLE_INSTANCE: &[&str] = &["from", "to", "subject", "date", "sender", "reply-to", "message-id"];
/// Mechanisms the receiving server must report as `pass`.
const RECEIVER_CHECKS: &[&str] = &["dkim", "spf", "dmarc"];
/// Headers marking machine-generated mail.
const AUTO_GENERATED: &[&str] = &["X-Autoreply", "Auto-Submitted"];

/// Gate stages in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStage {
    Parse,
    Signature,
    HeaderCoverage,
    Sender,
    SigningDomain,
    AllowedDomain,
    AllowedSender,
    ReceiverVerdict,
    AutoGenerated,
    Date,
    Delivery,
    Recipient,
}

impl fmt::Display for GateStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Parse => "parse",
            Self::Signature => "signature",
            Self::HeaderCoverage => "header coverage",
            Self::Sender => "sender",
            Self::SigningDomain => "signing domain",
            Self::AllowedDomain => "allowed domain",
            Self::AllowedSender => "allowed sender",
            Self::ReceiverVerdict => "receiver verdict",
            Self::AutoGenerated => "auto-generated",
            Self::Date => "date",
            Self::Delivery => "delivery address",
            Self::Recipient => "recipient",
        };
        f.write_str(s)
    }
}

/// Gate policy.
#[derive(Debug, Clone)]
pub struct GatePolicy {
    /// Lowercased authorized sender addresses. Empty rejects everyone.
    pub allowed_senders: BTreeSet<String>,
    /// Lowercased signing domains; empty disables the check.
    pub allowed_domains: BTreeSet<String>,
    pub max_future_skew: Duration,
    pub max_age: Duration,
    /// Skip the future/age checks (re-processing an old message by hand).
    pub allow_stale: bool,
    /// Demand dkim, spf and dmarc `pass` in `Authentication-Results`.
    pub require_authentication_results: bool,
    /// Anchored pattern for the whole `From` header.
    pub from_pattern: Option<Regex>,
    /// Lowercased delivery addresses with a handler.
    pub known_recipients: BTreeSet<String>,
}

impl GatePolicy {
    pub fn from_config(config: &GateConfig) -> Result<Self, ConfigError> {
        let lower = |items: &[String]| items.iter().map(|s| s.trim().to_ascii_lowercase()).collect();
        Ok(Self {
            allowed_senders: lower(&config.allowed_senders),
            allowed_domains: lower(&config.allowed_domains),
            max_future_skew: Duration::seconds(config.max_future_skew_secs),
            max_age: Duration::seconds(config.max_age_secs),
            allow_stale: false,
            require_authentication_results: config.require_authentication_results,
            from_pattern: config.from_regex()?,
            known_recipients: config
                .handlers
                .iter()
                .map(|h| h.address.trim().to_ascii_lowercase())
                .collect(),
        })
    }

    pub fn with_allow_stale(mut self, allow: bool) -> Self {
        self.allow_stale = allow;
        self
    }
}

/// Why a message was refused, with enough context to find it again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub stage: GateStage,
    pub error: VerificationError,
    /// Where the raw message came from (usually a file path).
    pub source: String,
    pub subject: Option<String>,
    pub message_id: Option<String>,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rejected at {} stage: {}", self.stage, self.error)
    }
}

/// A message that passed every stage.
#[derive(Debug, Clone)]
pub struct AcceptedMessage {
    pub message: RawMessage,
    pub signature: VerifiedSignature,
    /// Lowercased sender address.
    pub sender: String,
    pub date: DateTime<FixedOffset>,
    /// Lowercased delivery address.
    pub delivery_address: String,
    pub source: String,
}

impl AcceptedMessage {
    pub fn subject(&self) -> Option<String> {
        self.message.subject()
    }

    pub fn message_id(&self) -> Option<String> {
        self.message.message_id()
    }
}

/// Runs the stages in order against one verifier.
pub struct EmailGate<V> {
    policy: GatePolicy,
    verifier: V,
}

impl<V: SignatureVerifier> EmailGate<V> {
    pub fn new(policy: GatePolicy, verifier: V) -> Self {
        Self { policy, verifier }
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    #[instrument(skip(self, raw, now), fields(bytes = raw.len()))]
    pub async fn evaluate(
        &self,
        raw: &[u8],
        source: &str,
        now: DateTime<Utc>,
    ) -> Result<AcceptedMessage, Rejection> {
        let message = RawMessage::parse(raw).map_err(|error| Rejection {
            stage: GateStage::Parse,
            error,
            source: source.to_string(),
            subject: None,
            message_id: None,
        })?;
        let reject = |stage: GateStage, error: VerificationError| {
            warn!(%stage, %error, "message rejected");
            Rejection {
                stage,
                error,
                source: source.to_string(),
                subject: message.subject(),
                message_id: message.message_id(),
            }
        };

        let signature = self
            .verifier
            .verify(&message, now)
            .await
            .map_err(|e| reject(GateStage::Signature, e))?;

        check_coverage(&message, &signature).map_err(|e| reject(GateStage::HeaderCoverage, e))?;

        let sender = resolve_sender(&message).map_err(|e| reject(GateStage::Sender, e))?;

        let sender_domain = domain_of(&sender).unwrap_or_default();
        if sender_domain != signature.domain {
            return Err(reject(
                GateStage::SigningDomain,
                VerificationError::DomainMismatch {
                    sender_domain,
                    signing_domain: signature.domain.clone(),
                },
            ));
        }

        if !self.policy.allowed_domains.is_empty()
            && !self.policy.allowed_domains.contains(&signature.domain)
        {
            return Err(reject(
                GateStage::AllowedDomain,
                VerificationError::DomainNotAllowed(signature.domain.clone()),
            ));
        }

        if !self.policy.allowed_senders.contains(&sender) {
            return Err(reject(
                GateStage::AllowedSender,
                VerificationError::SenderNotAllowed(sender.clone()),
            ));
        }

        if let Some(ref pattern) = self.policy.from_pattern {
            let from = message.header("From").unwrap_or_default();
            if !pattern.is_match(from.trim()) {
                return Err(reject(
                    GateStage::AllowedSender,
                    VerificationError::FromPatternMismatch(from),
                ));
            }
        }

        if self.policy.require_authentication_results {
            check_receiver_verdict(&message).map_err(|e| reject(GateStage::ReceiverVerdict, e))?;
        }

        if let Some(header) = AUTO_GENERATED.iter().find(|h| message.has_header(h)) {
            return Err(reject(
                GateStage::AutoGenerated,
                VerificationError::AutoGenerated(header.to_string()),
            ));
        }

        let date = self
            .check_date(&message, now)
            .map_err(|e| reject(GateStage::Date, e))?;

        let delivery_address = resolve_delivery_address(&message)
            .ok_or_else(|| reject(GateStage::Delivery, VerificationError::NoDeliveryAddress))?;
        if !self.policy.known_recipients.contains(&delivery_address) {
            return Err(reject(
                GateStage::Recipient,
                VerificationError::UnknownRecipient(delivery_address),
            ));
        }

        info!(
            sender = %sender,
            domain = %signature.domain,
            to = %delivery_address,
            "message accepted"
        );
        Ok(AcceptedMessage {
            message,
            signature,
            sender,
            date,
            delivery_address,
            source: source.to_string(),
        })
    }

    fn check_date(
        &self,
        message: &RawMessage,
        now: DateTime<Utc>,
    ) -> Result<DateTime<FixedOffset>, VerificationError> {
        let raw = message.header("Date").ok_or(VerificationError::DateMissing)?;
        let date = parse_date(&raw).ok_or_else(|| VerificationError::DateUnparseable(raw.clone()))?;
        if self.policy.allow_stale {
            warn!(date = %date, "date window check overridden");
            return Ok(date);
        }
        let utc = date.with_timezone(&Utc);
        if utc > now + self.policy.max_future_skew {
            return Err(VerificationError::DateInFuture(date.to_rfc3339()));
        }
        if utc < now - self.policy.max_age {
            return Err(VerificationError::DateTooOld(date.to_rfc3339()));
        }
        Ok(date)
    }
}

fn check_coverage(message: &RawMessage, signature: &VerifiedSignature) -> Result<(), VerificationError> {
    for header in SINGLE_INSTANCE {
        if message.header_count(header) > 1 {
            return Err(VerificationError::DuplicateHeader(header.to_string()));
        }
    }
    for header in REQUIRED_SIGNED {
        if signature.covers(header) {
            continue;
        }
        // An absent Date cannot be signed; report it as missing.
        if *header == "date" && !message.has_header("Date") {
            return Err(VerificationError::DateMissing);
        }
        return Err(VerificationError::HeaderNotSigned(header.to_string()));
    }
    for header in SIGNED_IF_PRESENT {
        if message.has_header(header) && !signature.covers(header) {
            return Err(VerificationError::HeaderNotSigned(header.to_string()));
        }
    }
    Ok(())
}

/// The topmost `Authentication-Results` is the one the receiving server
/// added; every mechanism in [`RECEIVER_CHECKS`] must be `pass` there.
fn check_receiver_verdict(message: &RawMessage) -> Result<(), VerificationError> {
    let results = message.header("Authentication-Results").ok_or_else(|| {
        VerificationError::AuthenticationResults("no Authentication-Results header".into())
    })?;
    let verdicts: Vec<String> = results
        .split(';')
        .map(|part| part.trim().to_ascii_lowercase())
        .collect();
    for mechanism in RECEIVER_CHECKS {
        let pass = format!("{mechanism}=pass");
        let passed = verdicts.iter().any(|v| {
            v.strip_prefix(&pass)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace))
        });
        if !passed {
            return Err(VerificationError::AuthenticationResults(format!("{mechanism} did not pass")));
        }
    }
    Ok(())
}

/// The Sender header if present, else the only From address. The result
/// must be one of the From addresses.
fn resolve_sender(message: &RawMessage) -> Result<String, VerificationError> {
    let from: Vec<String> = message
        .header("From")
        .map(|v| parse_addresses(&v))
        .unwrap_or_default()
        .into_iter()
        .map(|a| a.to_ascii_lowercase())
        .collect();
    if from.is_empty() {
        return Err(VerificationError::SenderUnresolved("no From address".into()));
    }

    let sender = match message.header("Sender") {
        Some(value) => parse_addresses(&value)
            .into_iter()
            .next()
            .map(|a| a.to_ascii_lowercase())
            .ok_or_else(|| VerificationError::SenderUnresolved("unparseable Sender".into()))?,
        None if from.len() == 1 => from[0].clone(),
        None => {
            return Err(VerificationError::SenderUnresolved(
                "several From addresses and no Sender".into(),
            ))
        }
    };

    if !from.contains(&sender) {
        return Err(VerificationError::SenderUnresolved(format!(
            "sender {sender} is not among the From addresses"
        )));
    }
    Ok(sender)
}

/// Delivered-To, then `for <addr>` in Received, then the first To address.
pub fn resolve_delivery_address(message: &RawMessage) -> Option<String> {
    let delivered = message
        .header("Delivered-To")
        .and_then(|v| parse_addresses(&v).into_iter().next());
    let received = || {
        message.header_all("Received").iter().find_map(|v| {
            RECEIVED_FOR
                .captures(v)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
        })
    };
    let to = || {
        message
            .header("To")
            .and_then(|v| parse_addresses(&v).into_iter().next())
    };
    delivered
        .or_else(received)
        .or_else(to)
        .map(|a| a.trim().to_ascii_lowercase())
}
