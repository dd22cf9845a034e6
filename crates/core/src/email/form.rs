//! Form submissions rendered into mail bodies.
//!
//! In the HTML rendering every label is wrapped in `<strong>`; the text
//! between two labels is the value of the first. The plain-text fallback
//! reads `Label: value` lines.

use std::sync::LazyLock;

use mailparse::ParsedMail;
use regex_lite::Regex;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use super::message::RawMessage;
use crate::errors::VerificationError;
use crate::record::{keys, CanonicalRecord};
use crate::schema::KeyMap;

static STRONG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<strong\b[^>]*>(.*?)</strong>").expect("static regex is valid"));
static LINE_BREAK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<br\s*/?>|</(p|div|tr|td|li|h[1-6])>").expect("static regex is valid")
});
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("static regex is valid"));
static DOB: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2})-(\d{1,2})-(\d{4})$").expect("static regex is valid"));

/// Form bookkeeping labels that carry no member data.
const IGNORED_LABELS: &[&str] = &["id", "form_id", "url_page", "url_slug"];

/// Ordered label/value pairs from the message body.
pub fn extract_form_fields(message: &RawMessage) -> Result<Vec<(String, String)>, VerificationError> {
    let mime = message.mime()?;
    let (html, text) = bodies(&mime);
    if let Some(html) = html {
        debug!(len = html.len(), "extracting fields from HTML body");
        return Ok(fields_from_html(&html));
    }
    if let Some(text) = text {
        debug!(len = text.len(), "extracting fields from plain-text body");
        return Ok(fields_from_text(&text));
    }
    Err(VerificationError::Malformed("no text/html or text/plain body".into()))
}

fn bodies(mail: &ParsedMail<'_>) -> (Option<String>, Option<String>) {
    let mut html = None;
    let mut text = None;
    visit(mail, &mut |part| {
        let body = match part.get_body() {
            Ok(body) => body,
            Err(e) => {
                warn!(mimetype = %part.ctype.mimetype, error = %e, "undecodable body part");
                return;
            }
        };
        match part.ctype.mimetype.to_ascii_lowercase().as_str() {
            "text/html" if html.is_none() => html = Some(body),
            "text/plain" if text.is_none() => text = Some(body),
            _ => {}
        }
    });
    (html, text)
}

fn visit(mail: &ParsedMail<'_>, f: &mut dyn FnMut(&ParsedMail<'_>)) {
    if mail.subparts.is_empty() {
        f(mail);
    }
    for part in &mail.subparts {
        visit(part, f);
    }
}

/// Split rendered HTML on `<strong>` labels.
pub fn fields_from_html(html: &str) -> Vec<(String, String)> {
    // A random marker cannot collide with submitted text.
    let marker = Uuid::new_v4().to_string();
    let marked = STRONG.replace_all(html, |caps: &regex_lite::Captures<'_>| {
        format!("\n{marker}\n{}\n", &caps[1])
    });
    let text = decode_entities(&TAG.replace_all(&LINE_BREAK.replace_all(&marked, "\n"), ""));

    let parts: Vec<&str> = text.split(marker.as_str()).skip(1).collect();
    let count = parts.len();
    let mut fields = Vec::with_capacity(count);
    for (i, part) in parts.into_iter().enumerate() {
        let mut lines = part
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty());
        let Some(label) = lines.next() else {
            continue;
        };
        let label = label.trim_end_matches(':').trim().to_string();
        // The last field runs into the footer; keep only its first line.
        let value: Vec<&str> = if i + 1 == count {
            lines.take(1).collect()
        } else {
            lines.collect()
        };
        fields.push((label, value.join("\n")));
    }
    fields
}

/// `Label: value` lines; indented lines continue the previous value.
pub fn fields_from_text(text: &str) -> Vec<(String, String)> {
    let mut fields: Vec<(String, String)> = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = fields.last_mut() {
                if !value.is_empty() {
                    value.push('\n');
                }
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((label, value)) = line.split_once(':') {
            fields.push((label.trim().to_string(), value.trim().to_string()));
        }
    }
    fields
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&amp;", "&")
}

fn is_agreement(value: &str) -> bool {
    value.lines().next().map(str::trim) == Some("Agree")
}

/// Build a canonical record from form fields translated through `labels`.
///
/// Agreement answers are collected into `agreements`; labels without a
/// translation go to `other`. The date of birth is normalized to
/// `yyyy-mm-dd`; an unreadable one is kept in `other` instead.
pub fn form_to_canonical(fields: &[(String, String)], labels: &KeyMap) -> CanonicalRecord {
    let mut record = CanonicalRecord::new();
    let mut agreements = Vec::new();

    for (label, value) in fields {
        let agreement = is_agreement(value);
        if agreement {
            agreements.push(format!("{label}: {value}"));
        }
        if let Some(key) = labels.canonical(label) {
            record.set(key, Value::String(value.clone()));
            continue;
        }
        if agreement || IGNORED_LABELS.contains(&label.as_str()) {
            continue;
        }
        record.other.insert(label.clone(), Value::String(value.clone()));
    }

    if !agreements.is_empty() {
        record.set(keys::AGREEMENTS, Value::String(format!("{}\n", agreements.join("\n"))));
    }

    if let Some(raw) = record.date_of_birth.take() {
        match normalize_date_of_birth(&raw) {
            Some(dob) => record.date_of_birth = Some(dob),
            None => {
                warn!(value = %raw, "unreadable date of birth kept as a note");
                record.other.insert(keys::DATE_OF_BIRTH.to_string(), Value::String(raw));
            }
        }
    }
    record
}

/// `d-m-yyyy`, `d/m/yyyy` or `d m yyyy` to `yyyy-mm-dd`.
pub fn normalize_date_of_birth(raw: &str) -> Option<String> {
    let cleaned = raw.trim().replace([' ', '/'], "-");
    let caps = DOB.captures(&cleaned)?;
    let day: u32 = caps[1].parse().ok()?;
    let month: u32 = caps[2].parse().ok()?;
    Some(format!("{}-{month:02}-{day:02}", &caps[3]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaRegistry;

    const HTML: &str = r#"<html><body>
<p>Er is een nieuwe inschrijving.</p>
<table>
<tr><td><strong>Voornaam:</strong></td><td>Ann</td></tr>
<tr><td><strong>Achternaam</strong></td><td>de Vries &amp; Zn</td></tr>
<tr><td><strong>Geboortedatum</strong></td><td>3/7/2001</td></tr>
<tr><td><strong>Adres</strong></td><td>Straat 1<br>1234 AB Utrecht</td></tr>
<tr><td><strong>Privacyverklaring</strong></td><td>Agree</td></tr>
<tr><td><strong>form_id</strong></td><td>12</td></tr>
<tr><td><strong>Shirt</strong></td><td>L</td></tr>
</table>
<p>Verstuurd via het formulier</p>
</body></html>"#;

    fn labels() -> SchemaRegistry {
        let headers = vec!["Key".to_string(), "RegisterForm".to_string()];
        let rows = [
            ("first_name", "Voornaam"),
            ("last_name", "Achternaam"),
            ("date_of_birth", "Geboortedatum"),
            ("address", "Adres"),
        ]
        .iter()
        .map(|(k, v)| vec![k.to_string(), v.to_string()])
        .collect::<Vec<_>>();
        SchemaRegistry::from_rows("Key", &headers, &rows).unwrap()
    }

    #[test]
    fn test_fields_from_html() {
        let fields = fields_from_html(HTML);
        let labels: Vec<&str> = fields.iter().map(|(l, _)| l.as_str()).collect();
        assert_eq!(
            labels,
            vec!["Voornaam", "Achternaam", "Geboortedatum", "Adres", "Privacyverklaring", "form_id", "Shirt"]
        );
        assert_eq!(fields[1].1, "de Vries & Zn");
        assert_eq!(fields[3].1, "Straat 1\n1234 AB Utrecht");
        // The footer after the last field is cut off.
        assert_eq!(fields[6].1, "L");
    }

    #[test]
    fn test_fields_from_text() {
        let fields = fields_from_text("Voornaam: Ann\nAdres: Straat 1\n  1234 AB Utrecht\n\nShirt: L\n");
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[1], ("Adres".to_string(), "Straat 1\n1234 AB Utrecht".to_string()));
    }

    #[test]
    fn test_form_to_canonical() {
        let registry = labels();
        let record = form_to_canonical(&fields_from_html(HTML), registry.key_map("RegisterForm").unwrap());

        assert_eq!(record.first_name.as_deref(), Some("Ann"));
        assert_eq!(record.date_of_birth.as_deref(), Some("2001-07-03"));
        assert_eq!(record.get_str("agreements").as_deref(), Some("Privacyverklaring: Agree\n"));
        assert_eq!(record.other.get("Shirt"), Some(&Value::String("L".into())));
        assert!(!record.other.contains_key("form_id"));
        assert!(!record.other.contains_key("Privacyverklaring"));
    }

    #[test]
    fn test_unreadable_dob_becomes_note() {
        let registry = labels();
        let fields = vec![("Geboortedatum".to_string(), "last spring".to_string())];
        let record = form_to_canonical(&fields, registry.key_map("RegisterForm").unwrap());
        assert!(record.date_of_birth.is_none());
        assert_eq!(record.other.get("date_of_birth"), Some(&Value::String("last spring".into())));
    }

    #[test]
    fn test_normalize_date_of_birth() {
        assert_eq!(normalize_date_of_birth("3-7-2001").as_deref(), Some("2001-07-03"));
        assert_eq!(normalize_date_of_birth(" 03 07 2001 ").as_deref(), Some("2001-07-03"));
        assert_eq!(normalize_date_of_birth("31/12/1999").as_deref(), Some("1999-12-31"));
        assert_eq!(normalize_date_of_birth("2001-07-03"), None);
    }
}
