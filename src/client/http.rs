use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ClearanceReceipt, ComplianceCheck, ComplianceClient, ReportReceipt};
use crate::core::config::{ComplianceSettings, Endpoints};
use crate::core::error::{ComplianceError, ComplianceResult, ReasonCode, Rejection, SubmissionError};
use crate::crypto::SigningCertificate;
use crate::invoice::ubl_base64;
use crate::models::Invoice;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmissionRequest {
    invoice_hash: String,
    uuid: String,
    invoice: String,
}

impl SubmissionRequest {
    fn for_invoice(invoice: &Invoice) -> Self {
        SubmissionRequest {
            invoice_hash: STANDARD.encode(invoice.content_hash.as_bytes()),
            uuid: invoice.uuid().to_string(),
            invoice: ubl_base64(invoice),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorityMessage {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidationResults {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    warning_messages: Vec<AuthorityMessage>,
    #[serde(default)]
    error_messages: Vec<AuthorityMessage>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorityResponse {
    #[serde(default)]
    validation_results: Option<ValidationResults>,
    #[serde(default)]
    reporting_status: Option<String>,
    #[serde(default)]
    clearance_status: Option<String>,
    #[serde(default)]
    cleared_invoice: Option<String>,
    #[serde(default)]
    reference_id: Option<String>,
}

impl AuthorityResponse {
    fn results(&self) -> Option<&ValidationResults> {
        self.validation_results.as_ref()
    }

    fn warnings(&self) -> Vec<String> {
        self.results()
            .map(|r| r.warning_messages.iter().map(describe).collect())
            .unwrap_or_default()
    }

    fn rejection(&self) -> Option<Rejection> {
        let errors = &self.results()?.error_messages;
        if errors.is_empty() {
            return None;
        }
        Some(Rejection {
            reasons: errors
                .iter()
                .map(|m| {
                    ReasonCode::new(
                        m.code.clone().unwrap_or_else(|| "UNKNOWN".to_string()),
                        m.message.clone().unwrap_or_default(),
                    )
                })
                .collect(),
        })
    }

    fn validation_passed(&self) -> bool {
        match self.results().and_then(|r| r.status.as_deref()) {
            Some(status) => !status.eq_ignore_ascii_case("ERROR"),
            None => true,
        }
    }
}

fn describe(message: &AuthorityMessage) -> String {
    match (&message.code, &message.message) {
        (Some(code), Some(text)) => format!("{}: {}", code, text),
        (Some(code), None) => code.clone(),
        (None, Some(text)) => text.clone(),
        (None, None) => "unspecified".to_string(),
    }
}

/// Decides whether a status can be retried as-is.
///
/// Server errors, throttling, request timeouts and credential problems are
/// transient from the invoice's point of view; any other 4xx is the
/// authority refusing this invoice.
pub(crate) fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || matches!(
            status,
            StatusCode::TOO_MANY_REQUESTS
                | StatusCode::REQUEST_TIMEOUT
                | StatusCode::UNAUTHORIZED
                | StatusCode::FORBIDDEN
        )
}

fn classify(status: StatusCode, body: &str) -> Result<AuthorityResponse, SubmissionError> {
    if is_transient_status(status) {
        return Err(SubmissionError::Network(format!("authority returned {}", status)));
    }

    let parsed: Option<AuthorityResponse> = serde_json::from_str(body).ok();

    if status.is_success() {
        return Ok(parsed.unwrap_or_default());
    }

    let rejection = parsed
        .as_ref()
        .and_then(AuthorityResponse::rejection)
        .unwrap_or_else(|| Rejection {
            reasons: vec![ReasonCode::new(
                format!("HTTP-{}", status.as_u16()),
                body.chars().take(200).collect::<String>(),
            )],
        });
    Err(SubmissionError::Rejected(rejection))
}

/// `ComplianceClient` speaking JSON over HTTPS to the configured endpoints.
pub struct HttpComplianceClient {
    http: reqwest::Client,
    endpoints: Endpoints,
    username: String,
    secret: String,
}

impl HttpComplianceClient {
    pub fn new(settings: &ComplianceSettings, certificate: Option<&SigningCertificate>) -> ComplianceResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.queue.request_timeout())
            .build()
            .map_err(|e| ComplianceError::Config(format!("cannot build HTTP client: {}", e)))?;

        Ok(HttpComplianceClient {
            http,
            endpoints: settings.endpoints(),
            username: certificate
                .map(|c| STANDARD.encode(c.der()))
                .unwrap_or_default(),
            secret: settings.api_secret.clone().unwrap_or_default(),
        })
    }

    async fn post(&self, url: &str, invoice: &Invoice, clearance: bool) -> Result<AuthorityResponse, SubmissionError> {
        let mut request = self
            .http
            .post(url)
            .basic_auth(&self.username, Some(&self.secret))
            .header("Accept-Version", "V2")
            .header("Accept-Language", "en")
            .json(&SubmissionRequest::for_invoice(invoice));
        if clearance {
            request = request.header("Clearance-Status", "1");
        }

        let response = request.send().await.map_err(|e| {
            warn!(uuid = %invoice.uuid(), error = %e, timeout = e.is_timeout(), "Authority request failed");
            SubmissionError::Network(e.to_string())
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SubmissionError::Network(format!("cannot read response body: {}", e)))?;

        debug!(uuid = %invoice.uuid(), %status, "Authority responded");
        classify(status, &body)
    }
}

#[async_trait]
impl ComplianceClient for HttpComplianceClient {
    async fn check_compliance(&self, invoice: &Invoice) -> Result<ComplianceCheck, SubmissionError> {
        let response = self.post(&self.endpoints.compliance, invoice, false).await?;
        if let Some(rejection) = response.rejection() {
            return Err(SubmissionError::Rejected(rejection));
        }
        Ok(ComplianceCheck {
            accepted: response.validation_passed(),
            warnings: response.warnings(),
        })
    }

    async fn report_invoice(&self, invoice: &Invoice) -> Result<ReportReceipt, SubmissionError> {
        let response = self.post(&self.endpoints.reporting, invoice, false).await?;
        if let Some(rejection) = response.rejection() {
            return Err(SubmissionError::Rejected(rejection));
        }
        let accepted = response
            .reporting_status
            .as_deref()
            .map(|s| s.eq_ignore_ascii_case("REPORTED"))
            .unwrap_or_else(|| response.validation_passed());

        Ok(ReportReceipt {
            accepted,
            reference_id: response
                .reference_id
                .unwrap_or_else(|| invoice.uuid().to_string()),
        })
    }

    async fn clear_invoice(&self, invoice: &Invoice) -> Result<ClearanceReceipt, SubmissionError> {
        let response = self.post(&self.endpoints.clearance, invoice, true).await?;
        if let Some(rejection) = response.rejection() {
            return Err(SubmissionError::Rejected(rejection));
        }
        let accepted = response
            .clearance_status
            .as_deref()
            .map(|s| s.eq_ignore_ascii_case("CLEARED"))
            .unwrap_or_else(|| response.validation_passed());

        Ok(ClearanceReceipt {
            accepted,
            cleared_invoice_xml: response.cleared_invoice,
        })
    }
}
