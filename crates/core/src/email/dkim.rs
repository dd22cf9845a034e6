//! DKIM signature verification (RFC 6376, `rsa-sha256` only).

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, info, instrument, warn};

use super::message::{RawHeader, RawMessage};
use crate::errors::VerificationError;

// ---------------------------------------------------------------------------
// Signature header
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Canonicalization {
    Simple,
    Relaxed,
}

impl Canonicalization {
    fn parse(s: &str) -> Result<Self, VerificationError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simple" => Ok(Self::Simple),
            "relaxed" => Ok(Self::Relaxed),
            other => Err(VerificationError::SignatureInvalid(format!(
                "unknown canonicalization '{other}'"
            ))),
        }
    }
}

/// Parsed `DKIM-Signature` tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DkimSignature {
    pub domain: String,
    pub selector: String,
    pub header_canon: Canonicalization,
    pub body_canon: Canonicalization,
    /// `h=` names, lowercased, in signing order.
    pub signed_headers: Vec<String>,
    pub body_hash: String,
    pub signature: String,
    pub body_length: Option<usize>,
    pub timestamp: Option<i64>,
    pub expires: Option<i64>,
}

impl DkimSignature {
    pub fn parse(value: &str) -> Result<Self, VerificationError> {
        let tags = parse_tags(value);
        let invalid = |msg: &str| VerificationError::SignatureInvalid(msg.to_string());
        let required = |name: &str| {
            tags.get(name)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| invalid(&format!("missing '{name}=' tag")))
        };

        if let Some(v) = tags.get("v") {
            if v != "1" {
                return Err(invalid(&format!("unsupported version '{v}'")));
            }
        }
        let algorithm = required("a")?;
        if !algorithm.eq_ignore_ascii_case("rsa-sha256") {
            return Err(invalid(&format!("unsupported algorithm '{algorithm}'")));
        }

        let (header_canon, body_canon) = match tags.get("c") {
            None => (Canonicalization::Simple, Canonicalization::Simple),
            Some(c) => match c.split_once('/') {
                Some((h, b)) => (Canonicalization::parse(h)?, Canonicalization::parse(b)?),
                None => (Canonicalization::parse(c)?, Canonicalization::Simple),
            },
        };

        let signed_headers: Vec<String> = required("h")?
            .split(':')
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        if !signed_headers.iter().any(|h| h == "from") {
            return Err(invalid("'h=' does not include From"));
        }

        let number = |name: &str| -> Result<Option<i64>, VerificationError> {
            tags.get(name)
                .map(|v| v.parse::<i64>().map_err(|_| invalid(&format!("bad '{name}=' value"))))
                .transpose()
        };

        Ok(Self {
            domain: required("d")?.to_ascii_lowercase(),
            selector: required("s")?,
            header_canon,
            body_canon,
            signed_headers,
            body_hash: strip_whitespace(&required("bh")?),
            signature: strip_whitespace(&required("b")?),
            body_length: number("l")?.map(|l| l.max(0) as usize),
            timestamp: number("t")?,
            expires: number("x")?,
        })
    }

    /// DNS name of the public key record.
    pub fn key_name(&self) -> String {
        format!("{}._domainkey.{}", self.selector, self.domain)
    }
}

fn parse_tags(value: &str) -> BTreeMap<String, String> {
    value
        .split(';')
        .filter_map(|part| {
            let (name, value) = part.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), unfold_tag_value(value)))
        })
        .collect()
}

fn unfold_tag_value(value: &str) -> String {
    value.replace("\r\n", "").trim().to_string()
}

fn strip_whitespace(value: &str) -> String {
    value.chars().filter(|c| !c.is_whitespace()).collect()
}

// ---------------------------------------------------------------------------
// Canonicalization
// ---------------------------------------------------------------------------

/// Canonical body per RFC 6376 section 3.4.3/3.4.4.
pub fn canonicalize_body(body: &[u8], canon: Canonicalization) -> Vec<u8> {
    let mut lines: Vec<Vec<u8>> = split_lines(body)
        .into_iter()
        .map(|line| match canon {
            Canonicalization::Simple => line.to_vec(),
            Canonicalization::Relaxed => {
                let mut out = compress_wsp(line);
                while out.last().is_some_and(|b| *b == b' ') {
                    out.pop();
                }
                out
            }
        })
        .collect();
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }

    if lines.is_empty() {
        return match canon {
            Canonicalization::Simple => b"\r\n".to_vec(),
            Canonicalization::Relaxed => Vec::new(),
        };
    }
    let mut out = Vec::with_capacity(body.len());
    for line in lines {
        out.extend_from_slice(&line);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Canonical form of one header field, CRLF included.
pub fn canonicalize_header(header: &RawHeader, canon: Canonicalization) -> String {
    match canon {
        Canonicalization::Simple => header.raw.clone(),
        Canonicalization::Relaxed => format!("{}\r\n", relaxed_field(&header.name, header.raw_value())),
    }
}

fn relaxed_field(name: &str, raw_value: &str) -> String {
    let unfolded = raw_value.replace("\r\n", "");
    let value = String::from_utf8_lossy(&compress_wsp(unfolded.as_bytes()))
        .trim()
        .to_string();
    format!("{}:{}", name.trim().to_ascii_lowercase(), value)
}

fn compress_wsp(line: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(line.len());
    let mut in_wsp = false;
    for &b in line {
        if b == b' ' || b == b'\t' {
            if !in_wsp {
                out.push(b' ');
            }
            in_wsp = true;
        } else {
            out.push(b);
            in_wsp = false;
        }
    }
    out
}

fn split_lines(body: &[u8]) -> Vec<&[u8]> {
    let mut lines = Vec::new();
    let mut rest = body;
    while let Some(pos) = super::message::find(rest, b"\r\n") {
        lines.push(&rest[..pos]);
        rest = &rest[pos + 2..];
    }
    if !rest.is_empty() {
        lines.push(rest);
    }
    lines
}

/// The signature header with its `b=` value emptied, canonicalized and
/// without the trailing CRLF.
fn signature_header_input(header: &RawHeader, canon: Canonicalization) -> String {
    let raw = header.raw.strip_suffix("\r\n").unwrap_or(&header.raw);
    let (name, value) = raw.split_once(':').unwrap_or((raw, ""));

    let stripped = value
        .split(';')
        .map(|segment| match segment.split_once('=') {
            Some((tag, _)) if tag.trim() == "b" => format!("{tag}="),
            _ => segment.to_string(),
        })
        .collect::<Vec<_>>()
        .join(";");

    match canon {
        Canonicalization::Simple => format!("{name}:{stripped}"),
        Canonicalization::Relaxed => relaxed_field(name, &stripped),
    }
}

/// Bytes covered by the header hash, and the names actually present.
fn header_hash_input(
    message: &RawMessage,
    sig: &DkimSignature,
    sig_header: &RawHeader,
) -> (Vec<u8>, Vec<String>) {
    let headers = message.headers();
    let mut used = vec![false; headers.len()];
    let mut data = Vec::new();
    let mut covered = Vec::new();

    // Multiple instances of a name are consumed bottom-up.
    for name in &sig.signed_headers {
        let found = (0..headers.len())
            .rev()
            .find(|&i| !used[i] && headers[i].name.eq_ignore_ascii_case(name));
        if let Some(i) = found {
            used[i] = true;
            data.extend_from_slice(canonicalize_header(&headers[i], sig.header_canon).as_bytes());
            covered.push(name.clone());
        }
    }
    data.extend_from_slice(signature_header_input(sig_header, sig.header_canon).as_bytes());
    (data, covered)
}

/// Hash of the canonical body. An `l=` shorter than the body is refused:
/// anything past it would be unsigned content read as form data.
fn body_hash(message: &RawMessage, sig: &DkimSignature) -> Result<Vec<u8>, VerificationError> {
    let canonical = canonicalize_body(message.body(), sig.body_canon);
    if let Some(len) = sig.body_length {
        if len > canonical.len() {
            return Err(VerificationError::SignatureInvalid(
                "body shorter than signed length".into(),
            ));
        }
        if len < canonical.len() {
            return Err(VerificationError::SignatureInvalid(format!(
                "signature covers only {len} of {} body bytes",
                canonical.len()
            )));
        }
    }
    Ok(Sha256::digest(&canonical).to_vec())
}

// ---------------------------------------------------------------------------
// Key lookup
// ---------------------------------------------------------------------------

/// Looks up `selector._domainkey.domain` TXT records.
#[async_trait]
pub trait KeyResolver: Send + Sync {
    async fn txt_record(&self, name: &str) -> Result<Option<String>, VerificationError>;
}

/// Fixed key records, keyed by record name.
#[derive(Debug, Clone, Default)]
pub struct StaticKeyResolver {
    records: BTreeMap<String, String>,
}

impl StaticKeyResolver {
    pub fn new(records: BTreeMap<String, String>) -> Self {
        Self { records }
    }

    pub fn insert(&mut self, name: impl Into<String>, record: impl Into<String>) {
        self.records.insert(name.into(), record.into());
    }
}

#[async_trait]
impl KeyResolver for StaticKeyResolver {
    async fn txt_record(&self, name: &str) -> Result<Option<String>, VerificationError> {
        Ok(self.records.get(name).cloned())
    }
}

/// TXT lookup through a DNS-over-HTTPS JSON endpoint. Pinned records win
/// over DNS.
#[derive(Debug, Clone)]
pub struct DnsOverHttpsResolver {
    http: reqwest::Client,
    url: String,
    pinned: StaticKeyResolver,
}

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Status")]
    status: u32,
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    #[serde(rename = "type")]
    kind: u16,
    data: String,
}

const TXT: u16 = 16;

impl DnsOverHttpsResolver {
    pub fn new(url: &str, pinned: BTreeMap<String, String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.to_string(),
            pinned: StaticKeyResolver::new(pinned),
        }
    }
}

#[async_trait]
impl KeyResolver for DnsOverHttpsResolver {
    #[instrument(skip(self))]
    async fn txt_record(&self, name: &str) -> Result<Option<String>, VerificationError> {
        if let Some(pinned) = self.pinned.txt_record(name).await? {
            debug!("using pinned key");
            return Ok(Some(pinned));
        }

        let unavailable = |e: String| VerificationError::KeyUnavailable(format!("{name}: {e}"));
        let resp = self
            .http
            .get(&self.url)
            .header("Accept", "application/dns-json")
            .query(&[("name", name), ("type", "TXT")])
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(unavailable(format!("resolver returned {}", resp.status())));
        }
        let body: DohResponse = resp.json().await.map_err(|e| unavailable(e.to_string()))?;
        if body.status != 0 {
            debug!(status = body.status, "no TXT record");
            return Ok(None);
        }
        Ok(body
            .answer
            .iter()
            .find(|a| a.kind == TXT)
            .map(|a| join_txt_strings(&a.data)))
    }
}

/// `"v=DKIM1; " "p=MIIB..."` -> `v=DKIM1; p=MIIB...`.
fn join_txt_strings(data: &str) -> String {
    if !data.contains('"') {
        return data.to_string();
    }
    let mut out = String::new();
    let mut inside = false;
    let mut escaped = false;
    for c in data.chars() {
        match (inside, escaped, c) {
            (true, false, '\\') => escaped = true,
            (true, true, _) => {
                out.push(c);
                escaped = false;
            }
            (_, false, '"') => inside = !inside,
            (true, false, _) => out.push(c),
            _ => {}
        }
    }
    out
}

/// Parse a `v=DKIM1; k=rsa; p=...` key record. An empty `p=` is a revoked key.
pub fn parse_key_record(record: &str) -> Result<RsaPublicKey, VerificationError> {
    let tags = parse_tags(record);
    if let Some(k) = tags.get("k") {
        if !k.eq_ignore_ascii_case("rsa") {
            return Err(VerificationError::KeyUnavailable(format!("unsupported key type '{k}'")));
        }
    }
    let p = tags.get("p").map(|p| strip_whitespace(p)).unwrap_or_default();
    if p.is_empty() {
        return Err(VerificationError::SignatureInvalid("signing key has been revoked".into()));
    }
    let der = BASE64
        .decode(p.as_bytes())
        .map_err(|e| VerificationError::KeyUnavailable(format!("key is not base64: {e}")))?;
    RsaPublicKey::from_public_key_der(&der)
        .or_else(|_| RsaPublicKey::from_pkcs1_der(&der))
        .map_err(|e| VerificationError::KeyUnavailable(format!("unreadable RSA key: {e}")))
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Outcome of a successful verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedSignature {
    pub domain: String,
    pub selector: String,
    /// Lowercased names of header fields covered by the signature.
    pub signed_headers: Vec<String>,
}

impl VerifiedSignature {
    pub fn covers(&self, header: &str) -> bool {
        self.signed_headers.iter().any(|h| h.eq_ignore_ascii_case(header))
    }
}

#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    async fn verify(
        &self,
        message: &RawMessage,
        now: DateTime<Utc>,
    ) -> Result<VerifiedSignature, VerificationError>;
}

/// DKIM verifier over a key resolver.
pub struct DkimVerifier<R> {
    resolver: R,
}

impl<R: KeyResolver> DkimVerifier<R> {
    pub fn new(resolver: R) -> Self {
        Self { resolver }
    }

    async fn verify_one(
        &self,
        message: &RawMessage,
        header: &RawHeader,
        now: DateTime<Utc>,
    ) -> Result<VerifiedSignature, VerificationError> {
        let sig = DkimSignature::parse(header.raw_value())?;
        if let Some(expires) = sig.expires {
            if expires < now.timestamp() {
                return Err(VerificationError::SignatureInvalid("signature expired".into()));
            }
        }

        let expected_bh = BASE64
            .decode(sig.body_hash.as_bytes())
            .map_err(|_| VerificationError::SignatureInvalid("body hash is not base64".into()))?;
        let computed_bh = body_hash(message, &sig)?;
        if !bool::from(computed_bh.ct_eq(&expected_bh)) {
            return Err(VerificationError::SignatureInvalid("body hash mismatch".into()));
        }

        let record = self
            .resolver
            .txt_record(&sig.key_name())
            .await?
            .ok_or_else(|| VerificationError::KeyUnavailable(sig.key_name()))?;
        let key = parse_key_record(&record)?;

        let (data, covered) = header_hash_input(message, &sig, header);
        let signature = BASE64
            .decode(sig.signature.as_bytes())
            .map_err(|_| VerificationError::SignatureInvalid("signature is not base64".into()))?;
        key.verify(Pkcs1v15Sign::new::<Sha256>(), &Sha256::digest(&data), &signature)
            .map_err(|_| VerificationError::SignatureInvalid("RSA signature mismatch".into()))?;

        info!(domain = %sig.domain, selector = %sig.selector, "DKIM signature verified");
        Ok(VerifiedSignature {
            domain: sig.domain,
            selector: sig.selector,
            signed_headers: covered,
        })
    }
}

#[async_trait]
impl<R: KeyResolver> SignatureVerifier for DkimVerifier<R> {
    /// Accepts the first signature that verifies. All failing is an error
    /// carrying the first failure.
    async fn verify(
        &self,
        message: &RawMessage,
        now: DateTime<Utc>,
    ) -> Result<VerifiedSignature, VerificationError> {
        let mut first_error = None;
        for header in message
            .headers()
            .iter()
            .filter(|h| h.name.eq_ignore_ascii_case("DKIM-Signature"))
        {
            match self.verify_one(message, header, now).await {
                Ok(verified) => return Ok(verified),
                Err(e) => {
                    warn!(error = %e, "DKIM signature rejected");
                    first_error.get_or_insert(e);
                }
            }
        }
        Err(first_error.unwrap_or_else(|| {
            VerificationError::SignatureInvalid("no DKIM-Signature header".into())
        }))
    }
}

// ---------------------------------------------------------------------------
// Test signer
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::OnceLock;

    use rsa::pkcs8::EncodePublicKey;
    use rsa::RsaPrivateKey;

    use super::*;

    fn private_key() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        KEY.get_or_init(|| {
            let mut rng = rand::rngs::OsRng;
            RsaPrivateKey::new(&mut rng, 1024).unwrap()
        })
    }

    pub const SELECTOR: &str = "mail";

    /// Key record for the shared test key.
    pub fn key_record() -> String {
        let der = private_key().to_public_key().to_public_key_der().unwrap();
        format!("v=DKIM1; k=rsa; p={}", BASE64.encode(der.as_bytes()))
    }

    pub fn resolver_for(domain: &str) -> StaticKeyResolver {
        let mut resolver = StaticKeyResolver::default();
        resolver.insert(format!("{SELECTOR}._domainkey.{domain}"), key_record());
        resolver
    }

    /// Prepend a DKIM-Signature for `domain` covering `headers`.
    pub fn sign(message: &str, domain: &str, headers: &[&str], canon: &str) -> String {
        sign_with_length(message, domain, headers, canon, None)
    }

    /// As [`sign`], with an `l=` tag limiting the signed body.
    pub fn sign_with_length(
        message: &str,
        domain: &str,
        headers: &[&str],
        canon: &str,
        body_length: Option<usize>,
    ) -> String {
        let unsigned = RawMessage::parse(message.as_bytes()).unwrap();
        let (hc, bc) = canon.split_once('/').unwrap_or((canon, "simple"));
        let body_canon = Canonicalization::parse(bc).unwrap();
        let canonical = canonicalize_body(unsigned.body(), body_canon);
        let signed_body = &canonical[..body_length.unwrap_or(canonical.len())];
        let bh = BASE64.encode(Sha256::digest(signed_body));
        let length_tag = body_length.map(|l| format!(" l={l};")).unwrap_or_default();

        let value = format!(
            " v=1; a=rsa-sha256; c={canon}; d={domain}; s={SELECTOR};{length_tag}\r\n\th={}; bh={bh}; b=",
            headers.join(":")
        );
        let sig_header = RawHeader {
            name: "DKIM-Signature".into(),
            raw: format!("DKIM-Signature:{value}\r\n"),
        };
        let sig = DkimSignature {
            domain: domain.to_string(),
            selector: SELECTOR.to_string(),
            header_canon: Canonicalization::parse(hc).unwrap(),
            body_canon,
            signed_headers: headers.iter().map(|h| h.to_ascii_lowercase()).collect(),
            body_hash: bh,
            signature: String::new(),
            body_length,
            timestamp: None,
            expires: None,
        };
        let (data, _) = header_hash_input(&unsigned, &sig, &sig_header);
        let signature = private_key()
            .sign(Pkcs1v15Sign::new::<Sha256>(), &Sha256::digest(&data))
            .unwrap();

        let text = String::from_utf8(unsigned.as_bytes().to_vec()).unwrap();
        format!("DKIM-Signature:{value}{}\r\n{text}", BASE64.encode(signature))
    }
}
