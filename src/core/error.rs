use thiserror::Error;

/// Motivo de rechazo devuelto por la autoridad fiscal.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ReasonCode {
    pub code: String,
    pub message: String,
}

impl ReasonCode {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        ReasonCode {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Rejection {
    pub reasons: Vec<ReasonCode>,
}

impl Rejection {
    pub fn summary(&self) -> String {
        self.reasons
            .iter()
            .map(|r| format!("{}: {}", r.code, r.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Fallo de un envío a la autoridad. Solo `Network` es reintentable.
#[derive(Debug, Clone, Error)]
pub enum SubmissionError {
    #[error("Error de red: {0}")]
    Network(String),
    #[error("Rechazado por la autoridad: {}", .0.summary())]
    Rejected(Rejection),
}

#[derive(Debug, Error)]
pub enum ComplianceError {
    #[error("Error de validación en `{field}`: {message}")]
    Validation { field: String, message: String },

    #[error("Error de integridad de la cadena: {0}")]
    ChainIntegrity(String),

    #[error("Error de firma: {0}")]
    Signing(String),

    #[error("Payload QR mal formado: {0}")]
    MalformedPayload(String),

    #[error("Error de red: {0}")]
    Network(String),

    #[error("Rechazado por la autoridad: {}", .0.summary())]
    Rejection(Rejection),

    #[error("Error de almacenamiento: {0}")]
    Storage(String),

    #[error("Error de configuración: {0}")]
    Config(String),

    #[error("Entrada de cola {id}: {message}")]
    QueueEntry { id: uuid::Uuid, message: String },
}

impl ComplianceError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        ComplianceError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ComplianceError::Network(_))
    }
}

impl From<SubmissionError> for ComplianceError {
    fn from(error: SubmissionError) -> Self {
        match error {
            SubmissionError::Network(msg) => ComplianceError::Network(msg),
            SubmissionError::Rejected(rejection) => ComplianceError::Rejection(rejection),
        }
    }
}

impl From<sqlx::Error> for ComplianceError {
    fn from(error: sqlx::Error) -> Self {
        ComplianceError::Storage(error.to_string())
    }
}

impl From<serde_json::Error> for ComplianceError {
    fn from(error: serde_json::Error) -> Self {
        ComplianceError::Storage(error.to_string())
    }
}

impl From<config::ConfigError> for ComplianceError {
    fn from(error: config::ConfigError) -> Self {
        ComplianceError::Config(error.to_string())
    }
}

pub type ComplianceResult<T> = Result<T, ComplianceError>;
