use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use super::error::{ComplianceError, ComplianceResult};

const SANDBOX_BASE_URL: &str = "https://gw-fatoora.zatca.gov.sa/e-invoicing/developer-portal";
const PRODUCTION_BASE_URL: &str = "https://gw-fatoora.zatca.gov.sa/e-invoicing/core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Sandbox,
    Production,
}

impl Environment {
    pub fn base_url(&self) -> &'static str {
        match self {
            Environment::Sandbox => SANDBOX_BASE_URL,
            Environment::Production => PRODUCTION_BASE_URL,
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Sandbox => write!(f, "sandbox"),
            Environment::Production => write!(f, "production"),
        }
    }
}

/// Identity fields of the taxpayer, as submitted in the CSR.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsrIdentity {
    pub common_name: String,
    pub legal_name: String,
    pub vat_number: String,
    pub registration_number: String,
    pub address: String,
    #[serde(default)]
    pub organization_unit: Option<String>,
    #[serde(default = "default_country")]
    pub country: String,
    #[serde(default = "default_invoice_type")]
    pub invoice_type: String,
    #[serde(default)]
    pub industry: Option<String>,
}

fn default_country() -> String {
    "SA".to_string()
}

// Simplified + standard
fn default_invoice_type() -> String {
    "1100".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointOverrides {
    pub compliance: Option<String>,
    pub reporting: Option<String>,
    pub clearance: Option<String>,
}

/// Resolved URLs for the three remote operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub compliance: String,
    pub reporting: String,
    pub clearance: String,
}

impl Endpoints {
    pub fn for_environment(environment: Environment, overrides: &EndpointOverrides) -> Self {
        let base = environment.base_url();
        Endpoints {
            compliance: overrides
                .compliance
                .clone()
                .unwrap_or_else(|| format!("{}/compliance/invoices", base)),
            reporting: overrides
                .reporting
                .clone()
                .unwrap_or_else(|| format!("{}/invoices/reporting/single", base)),
            clearance: overrides
                .clearance
                .clone()
                .unwrap_or_else(|| format!("{}/invoices/clearance/single", base)),
        }
    }
}

/// Exponential backoff with a capped ceiling.
/// Longest delay or window a setting may ask for (100 years).
pub const MAX_WINDOW_SECS: u64 = 100 * 365 * 24 * 60 * 60;
pub const MAX_RETENTION_DAYS: i64 = 100 * 365;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

fn default_initial_delay_secs() -> u64 {
    5
}

fn default_multiplier() -> u32 {
    2
}

fn default_max_delay_secs() -> u64 {
    3600
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            initial_delay_secs: default_initial_delay_secs(),
            multiplier: default_multiplier(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

impl BackoffConfig {
    /// Delay before the next try after `attempt` failed attempts (1-based).
    pub fn delay(&self, attempt: u32) -> chrono::Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = u64::from(self.multiplier.max(1))
            .checked_pow(exponent)
            .unwrap_or(u64::MAX);
        let secs = self
            .initial_delay_secs
            .saturating_mul(factor)
            .min(self.max_delay_secs)
            .min(MAX_WINDOW_SECS);
        chrono::Duration::seconds(secs as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default = "default_overdue_after_secs")]
    pub overdue_after_secs: u64,
    #[serde(default = "default_drain_interval_secs")]
    pub drain_interval_secs: u64,
    #[serde(default = "default_completed_retention_days")]
    pub completed_retention_days: i64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_overdue_after_secs() -> u64 {
    24 * 60 * 60
}

fn default_drain_interval_secs() -> u64 {
    30
}

fn default_completed_retention_days() -> i64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_attempts: default_max_attempts(),
            backoff: BackoffConfig::default(),
            overdue_after_secs: default_overdue_after_secs(),
            drain_interval_secs: default_drain_interval_secs(),
            completed_retention_days: default_completed_retention_days(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl QueueConfig {
    pub fn overdue_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.overdue_after_secs.min(MAX_WINDOW_SECS) as i64)
    }

    pub fn drain_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.drain_interval_secs.max(1))
    }

    pub fn completed_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.completed_retention_days.clamp(0, MAX_RETENTION_DAYS))
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }
}

/// Settings for one service instance. Never mutated after the service is
/// built; a change means constructing a new `ComplianceService`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceSettings {
    #[serde(default)]
    pub environment: Environment,
    pub certificate_path: PathBuf,
    pub private_key_path: PathBuf,
    pub csr: CsrIdentity,
    #[serde(default)]
    pub endpoints: EndpointOverrides,
    #[serde(default = "default_auto_submit")]
    pub auto_submit: bool,
    /// Secret paired with the certificate for Basic auth against the authority.
    #[serde(default)]
    pub api_secret: Option<String>,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Bearer token for the local HTTP surface.
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default)]
    pub queue: QueueConfig,
}

fn default_auto_submit() -> bool {
    true
}

fn default_database_url() -> String {
    "sqlite://einvoice.db".to_string()
}

impl ComplianceSettings {
    pub fn new(
        environment: Environment,
        certificate_path: impl Into<PathBuf>,
        private_key_path: impl Into<PathBuf>,
        csr: CsrIdentity,
    ) -> Self {
        ComplianceSettings {
            environment,
            certificate_path: certificate_path.into(),
            private_key_path: private_key_path.into(),
            csr,
            endpoints: EndpointOverrides::default(),
            auto_submit: default_auto_submit(),
            api_secret: None,
            database_url: default_database_url(),
            api_token: None,
            queue: QueueConfig::default(),
        }
    }

    /// Loads settings from `EINVOICE_CONFIG` (default `einvoice.toml`, optional)
    /// layered with `EINVOICE__*` environment variables.
    pub fn load() -> ComplianceResult<Self> {
        let path = std::env::var("EINVOICE_CONFIG").unwrap_or_else(|_| "einvoice.toml".to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> ComplianceResult<Self> {
        let settings: ComplianceSettings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(config::Environment::with_prefix("EINVOICE").separator("__"))
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> ComplianceResult<()> {
        if !is_vat_number(&self.csr.vat_number) {
            return Err(ComplianceError::Config(format!(
                "csr.vat_number must be 15 digits, got `{}`",
                self.csr.vat_number
            )));
        }
        if self.csr.legal_name.trim().is_empty() {
            return Err(ComplianceError::Config("csr.legal_name is empty".to_string()));
        }
        if self.queue.max_attempts == 0 {
            return Err(ComplianceError::Config("queue.max_attempts must be at least 1".to_string()));
        }
        for (name, secs) in [
            ("queue.backoff.initial_delay_secs", self.queue.backoff.initial_delay_secs),
            ("queue.backoff.max_delay_secs", self.queue.backoff.max_delay_secs),
            ("queue.overdue_after_secs", self.queue.overdue_after_secs),
        ] {
            if secs > MAX_WINDOW_SECS {
                return Err(ComplianceError::Config(format!(
                    "{} must be at most {} seconds, got {}",
                    name, MAX_WINDOW_SECS, secs
                )));
            }
        }
        if !(0..=MAX_RETENTION_DAYS).contains(&self.queue.completed_retention_days) {
            return Err(ComplianceError::Config(format!(
                "queue.completed_retention_days must be between 0 and {}, got {}",
                MAX_RETENTION_DAYS, self.queue.completed_retention_days
            )));
        }
        Ok(())
    }

    pub fn endpoints(&self) -> Endpoints {
        Endpoints::for_environment(self.environment, &self.endpoints)
    }
}

pub fn is_vat_number(value: &str) -> bool {
    value.len() == 15 && value.bytes().all(|b| b.is_ascii_digit())
}
