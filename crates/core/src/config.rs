//! TOML-based configuration system for rostersync.
//!
//! All sensitive values (API tokens, webhook URLs, SMTP passwords) are stored
//! as `_env` fields that reference environment variable names. The actual
//! secrets are resolved at runtime via [`AppConfig::resolve_env_vars`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::diff::{Audience, ParticipationRule};
use crate::errors::ConfigError;
use crate::matcher::PrimaryKey;
use crate::record::keys;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Logging and cache locations.
    #[serde(default)]
    pub run: RunConfig,

    /// Field-translation table location.
    pub schema: SchemaConfig,

    /// External systems, keyed by a short local name (`conscribo`, `laposta`).
    #[serde(default)]
    pub platforms: BTreeMap<String, PlatformConfig>,

    /// Matching and diff policy.
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// Mark-and-sweep wire names.
    #[serde(default)]
    pub tracking: TrackingConfig,

    /// Batching and pacing.
    #[serde(default)]
    pub applicator: ApplicatorConfig,

    /// Inbound mail gate.
    #[serde(default)]
    pub gate: GateConfig,

    /// Notification settings (Slack, email).
    #[serde(default)]
    pub notifications: NotificationConfig,
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Process-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// When set, logs are also written to a daily-rolling file here.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Directory for the lookup cache.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|d| d.join("rostersync"))
        .unwrap_or_else(|| PathBuf::from(".cache/rostersync"))
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_dir: None,
            cache_dir: default_cache_dir(),
        }
    }
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Where the field-translation table lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaConfig {
    /// Spreadsheet URL (an `/edit` URL is rewritten to its TSV export).
    pub url: String,

    /// Header of the canonical-key column.
    #[serde(default = "default_key_column")]
    pub key_column: String,
}

fn default_key_column() -> String {
    "Key".into()
}

// ---------------------------------------------------------------------------
// Platforms
// ---------------------------------------------------------------------------

/// One external system reached over HTTP/JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// API root, e.g. `https://api.laposta.nl/v2`.
    pub base_url: String,

    /// Environment variable holding the API token.
    pub token_env: String,

    /// Header carrying the token. Unset means `Authorization: Bearer`.
    #[serde(default)]
    pub auth_header: Option<String>,

    /// Column of the translation table naming this system's fields.
    pub schema_column: String,

    /// Canonical key whose field receives untranslated data on create.
    #[serde(default = "default_notes_key")]
    pub notes_key: String,

    /// External field holding the platform's own record id, used in write
    /// paths. Unset means records are addressed by canonical identity.
    #[serde(default)]
    pub id_field: Option<String>,

    /// Record listing endpoint.
    #[serde(default)]
    pub list: Option<ListEndpoint>,

    /// Create/update/delete endpoints.
    #[serde(default)]
    pub write: Option<WriteEndpoint>,

    /// Bulk upsert endpoint (mark-and-sweep targets).
    #[serde(default)]
    pub upsert: Option<UpsertEndpoint>,

    /// Group endpoints.
    #[serde(default)]
    pub groups: Option<GroupEndpoints>,

    /// Resolved token (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub token: Option<String>,
}

fn default_notes_key() -> String {
    "notes".into()
}

/// `GET` endpoint returning a list of nested records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListEndpoint {
    pub path: String,

    /// JSON pointer to the record array in the response (empty = root).
    #[serde(default)]
    pub records_pointer: String,

    /// JSON pointer applied to every array element (e.g. `/member`).
    #[serde(default)]
    pub item_pointer: String,

    #[serde(default)]
    pub query: BTreeMap<String, String>,
}

/// Write endpoints. `{id}` in a path is replaced by the record id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteEndpoint {
    pub create_path: String,
    pub update_path: String,
    pub delete_path: String,

    /// HTTP method used for updates (default `PATCH`).
    #[serde(default = "default_update_method")]
    pub update_method: String,

    /// JSON pointer to the new record's id in a create response.
    #[serde(default)]
    pub id_pointer: Option<String>,

    /// Extra top-level fields merged into every create/update payload.
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_update_method() -> String {
    "PATCH".into()
}

/// Bulk upsert endpoint. `{table}` is replaced by the record-set name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertEndpoint {
    pub path: String,
}

/// Group endpoints. `{group}` is replaced by the group id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupEndpoints {
    pub list_path: String,
    #[serde(default)]
    pub list_pointer: String,
    #[serde(default = "default_group_id_field")]
    pub id_field: String,
    #[serde(default = "default_group_name_field")]
    pub name_field: String,

    pub members_path: String,
    #[serde(default)]
    pub members_pointer: String,

    pub create_path: String,
    pub add_path: String,
    pub remove_path: String,

    /// Body field carrying member ids on add/remove.
    #[serde(default = "default_member_ids_field")]
    pub member_ids_field: String,
}

fn default_group_id_field() -> String {
    "id".into()
}
fn default_group_name_field() -> String {
    "name".into()
}
fn default_member_ids_field() -> String {
    "members".into()
}

// ---------------------------------------------------------------------------
// Reconcile
// ---------------------------------------------------------------------------

/// Matching and diff policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default)]
    pub primary_key: PrimaryKey,

    /// Canonical keys resolved and compared for every record.
    #[serde(default = "default_fields")]
    pub fields: Vec<String>,

    /// Fields whose disagreement forces a remove-then-add.
    #[serde(default = "default_identity_fields")]
    pub identity_fields: Vec<String>,

    /// Desired records missing any of these are skipped.
    #[serde(default = "default_required")]
    pub required: Vec<String>,

    /// Target records whose membership id equals this are left alone.
    #[serde(default = "default_ignore_marker")]
    pub ignore_marker: String,

    #[serde(default = "default_participation")]
    pub participation: Vec<ParticipationRule>,

    /// Source group whose members never receive communication.
    #[serde(default)]
    pub block_group: Option<String>,
}

fn default_fields() -> Vec<String> {
    vec![
        keys::EMAIL.into(),
        keys::FIRST_NAME.into(),
        keys::LAST_NAME.into(),
        keys::DATE_OF_BIRTH.into(),
        keys::MEMBERSHIP_ID.into(),
    ]
}
fn default_identity_fields() -> Vec<String> {
    vec![
        keys::FIRST_NAME.into(),
        keys::LAST_NAME.into(),
        keys::DATE_OF_BIRTH.into(),
    ]
}
fn default_required() -> Vec<String> {
    vec![keys::EMAIL.into()]
}
fn default_ignore_marker() -> String {
    "ignore".into()
}
fn default_participation() -> Vec<ParticipationRule> {
    vec![
        ParticipationRule {
            flag: "send_birthday".into(),
            audience: Audience::Member,
            requires: vec![keys::DATE_OF_BIRTH.into()],
        },
        ParticipationRule {
            flag: "send_newsletter".into(),
            audience: Audience::Member,
            requires: Vec::new(),
        },
        ParticipationRule {
            flag: "send_birthday_alumnus".into(),
            audience: Audience::Alumnus,
            requires: vec![keys::DATE_OF_BIRTH.into()],
        },
    ]
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            primary_key: PrimaryKey::default(),
            fields: default_fields(),
            identity_fields: default_identity_fields(),
            required: default_required(),
            ignore_marker: default_ignore_marker(),
            participation: default_participation(),
            block_group: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tracking (mark-and-sweep)
// ---------------------------------------------------------------------------

/// Column names and sentinel values of an upsert-only target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Default logical record set (table) to sync into.
    #[serde(default)]
    pub record_set: Option<String>,

    /// Canonical key used as the upsert match value.
    #[serde(default = "default_match_key")]
    pub match_key: String,

    /// Column holding the match value.
    #[serde(default = "default_match_column")]
    pub match_column: String,

    /// Boolean column marking rows owned by the sync.
    #[serde(default = "default_synced_column")]
    pub synced_column: String,

    /// Boolean tracking-marker column.
    #[serde(default = "default_tracked_column")]
    pub tracked_column: String,

    /// Fixed values written with every upsert. Far-future/past constants
    /// survive clock skew and server-side recomputation.
    #[serde(default = "default_sentinels")]
    pub sentinels: BTreeMap<String, String>,
}

fn default_match_key() -> String {
    keys::EMAIL.into()
}
fn default_match_column() -> String {
    "synced_as".into()
}
fn default_synced_column() -> String {
    "is_synced".into()
}
fn default_tracked_column() -> String {
    "is_tracked".into()
}
fn default_sentinels() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("last_synced_at".to_string(), "2050-01-01T00:00Z".to_string()),
        ("modified".to_string(), "2025-01-01T00:00Z".to_string()),
    ])
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            record_set: None,
            match_key: default_match_key(),
            match_column: default_match_column(),
            synced_column: default_synced_column(),
            tracked_column: default_tracked_column(),
            sentinels: default_sentinels(),
        }
    }
}

// ---------------------------------------------------------------------------
// Applicator
// ---------------------------------------------------------------------------

/// Write throughput policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicatorConfig {
    /// Records per write call (default 2).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Milliseconds to wait between batches (default 2000).
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,
}

fn default_batch_size() -> usize {
    2
}
fn default_pacing_ms() -> u64 {
    2000
}

impl Default for ApplicatorConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            pacing_ms: default_pacing_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

/// What an accepted message is used for.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    /// Self-service registration form.
    #[default]
    Registration,
}

/// A delivery address and what to do with mail sent to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    pub address: String,

    #[serde(default)]
    pub kind: HandlerKind,

    /// Translation-table column holding the form's labels.
    #[serde(default = "default_form_column")]
    pub form_column: String,

    /// Platform the new record is created in.
    pub target: String,

    /// Groups the new record is added to.
    #[serde(default)]
    pub groups: Vec<String>,

    /// Value stored as `membership_type` on new records.
    #[serde(default)]
    pub membership_type: Option<String>,
}

fn default_form_column() -> String {
    "RegisterForm".into()
}

/// Inbound mail policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Addresses permitted to submit mail.
    #[serde(default)]
    pub allowed_senders: Vec<String>,

    /// Signing domains permitted. Empty disables the check.
    #[serde(default)]
    pub allowed_domains: Vec<String>,

    #[serde(default = "default_max_future_skew")]
    pub max_future_skew_secs: i64,

    #[serde(default = "default_max_age")]
    pub max_age_secs: i64,

    /// DNS-over-HTTPS JSON endpoint used for key lookup.
    #[serde(default = "default_doh_url")]
    pub doh_url: String,

    /// Keys pinned by `selector._domainkey.domain`, as TXT record text.
    #[serde(default)]
    pub pinned_keys: BTreeMap<String, String>,

    /// Also demand the receiving server's `Authentication-Results` verdict
    /// with dkim, spf and dmarc all `pass` (SES-style relays).
    #[serde(default)]
    pub require_authentication_results: bool,

    /// Pattern the whole `From` header must match, e.g.
    /// `.* <(info|forms)@example\.org>`.
    #[serde(default)]
    pub from_pattern: Option<String>,

    #[serde(default)]
    pub handlers: Vec<HandlerConfig>,
}

fn default_max_future_skew() -> i64 {
    300
}
fn default_max_age() -> i64 {
    86_400
}
fn default_doh_url() -> String {
    "https://dns.google/resolve".into()
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            allowed_senders: Vec::new(),
            allowed_domains: Vec::new(),
            max_future_skew_secs: default_max_future_skew(),
            max_age_secs: default_max_age(),
            doh_url: default_doh_url(),
            pinned_keys: BTreeMap::new(),
            require_authentication_results: false,
            from_pattern: None,
            handlers: Vec::new(),
        }
    }
}

impl GateConfig {
    /// `from_pattern` anchored to the whole header value.
    pub fn from_regex(&self) -> Result<Option<Regex>, ConfigError> {
        self.from_pattern
            .as_deref()
            .map(|p| {
                Regex::new(&format!("^(?:{p})$"))
                    .map_err(|e| invalid("gate.from_pattern", &e.to_string()))
            })
            .transpose()
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Notification channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotificationConfig {
    /// Environment variable holding the Slack incoming-webhook URL.
    #[serde(default)]
    pub slack_webhook_url_env: Option<String>,

    /// SMTP server address for email notifications (e.g. `smtp.example.com:587`).
    #[serde(default)]
    pub email_smtp: Option<String>,

    /// Sender email address.
    #[serde(default)]
    pub email_from: Option<String>,

    /// Recipient email addresses.
    #[serde(default)]
    pub email_recipients: Vec<String>,

    #[serde(default)]
    pub smtp_username: Option<String>,

    /// Environment variable holding the SMTP password.
    #[serde(default)]
    pub smtp_password_env: Option<String>,

    /// Resolved Slack webhook URL.
    #[serde(skip)]
    pub slack_webhook_url: Option<String>,

    /// Resolved SMTP password.
    #[serde(skip)]
    pub smtp_password: Option<String>,
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!(platforms = config.platforms.len(), "configuration parsed successfully");
        Ok(config)
    }

    /// Resolve all `*_env` fields from environment variables.
    ///
    /// A missing variable only warns here. Platforms refuse to connect
    /// without their token, so the failure surfaces where it matters.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        info!("resolving environment variable references in config");

        for (name, platform) in &mut self.platforms {
            platform.token = resolve_optional_env(
                &platform.token_env,
                &format!("platforms.{name}.token_env"),
            );
        }

        if let Some(ref env_name) = self.notifications.slack_webhook_url_env {
            self.notifications.slack_webhook_url =
                resolve_optional_env(env_name, "notifications.slack_webhook_url_env");
        }

        if let Some(ref env_name) = self.notifications.smtp_password_env {
            self.notifications.smtp_password =
                resolve_optional_env(env_name, "notifications.smtp_password_env");
        }

        debug!("environment variable resolution complete");
        Ok(())
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schema.url.is_empty() {
            return Err(invalid("schema.url", "translation table URL must not be empty"));
        }
        if self.applicator.batch_size == 0 {
            return Err(invalid("applicator.batch_size", "batch size must be >= 1"));
        }
        if self.gate.max_future_skew_secs < 0 || self.gate.max_age_secs <= 0 {
            return Err(invalid(
                "gate.max_age_secs",
                "skew must be >= 0 and max age must be > 0",
            ));
        }

        for (name, platform) in &self.platforms {
            if platform.base_url.is_empty() {
                return Err(invalid(
                    &format!("platforms.{name}.base_url"),
                    "base URL must not be empty",
                ));
            }
            if platform.schema_column.is_empty() {
                return Err(invalid(
                    &format!("platforms.{name}.schema_column"),
                    "schema column must not be empty",
                ));
            }
        }

        for rule in &self.reconcile.participation {
            if rule.flag.is_empty() {
                return Err(invalid(
                    "reconcile.participation",
                    "participation flag must not be empty",
                ));
            }
        }

        self.gate.from_regex()?;

        for handler in &self.gate.handlers {
            if !handler.address.contains('@') {
                return Err(invalid(
                    "gate.handlers.address",
                    &format!("'{}' is not an email address", handler.address),
                ));
            }
            if !self.platforms.contains_key(&handler.target) {
                return Err(ConfigError::UnknownPlatform(handler.target.clone()));
            }
        }

        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Look up a configured platform by name.
    pub fn platform(&self, name: &str) -> Result<&PlatformConfig, ConfigError> {
        self.platforms
            .get(name)
            .ok_or_else(|| ConfigError::UnknownPlatform(name.to_string()))
    }
}

fn invalid(field: &str, detail: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        detail: detail.into(),
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}

/// Commented starter configuration written by `rostersync init`.
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# rostersync configuration

[run]
log_level = "info"
# log_dir = "/var/log/rostersync"

[schema]
url = "https://docs.google.com/spreadsheets/d/SPREADSHEET_ID/edit?gid=0#gid=0"
key_column = "Key"

[platforms.conscribo]
base_url = "https://secure.conscribo.nl/api"
token_env = "CONSCRIBO_TOKEN"
schema_column = "Conscribo"

[platforms.conscribo.list]
path = "/relations/members"
records_pointer = "/relations"

[platforms.conscribo.write]
create_path = "/relations"
update_path = "/relations/{id}"
delete_path = "/relations/{id}"
id_pointer = "/relationId"

[platforms.laposta]
base_url = "https://api.laposta.nl/v2"
token_env = "LAPOSTA_TOKEN"
schema_column = "Laposta"

[platforms.laposta.list]
path = "/member"
records_pointer = "/data"
item_pointer = "/member"

[platforms.laposta.write]
create_path = "/member"
update_path = "/member/{id}"
delete_path = "/member/{id}"

[reconcile]
primary_key = "email"
ignore_marker = "ignore"
# block_group = "no-email"

[applicator]
batch_size = 2
pacing_ms = 2000

[gate]
allowed_senders = ["forms@example.org"]
allowed_domains = ["example.org"]
max_future_skew_secs = 300
max_age_secs = 86400
# require_authentication_results = true
# from_pattern = '.* <(info|forms)@example\.org>'

# [[gate.handlers]]
# address = "register@example.org"
# kind = "registration"
# target = "conscribo"
# groups = ["new-members"]
# membership_type = "member"

[notifications]
# slack_webhook_url_env = "SLACK_WEBHOOK_URL"
# email_smtp = "smtp.example.org:587"
# email_from = "rostersync@example.org"
# email_recipients = ["admin@example.org"]
"#;
