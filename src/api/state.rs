use std::sync::Arc;

use crate::service::ComplianceService;

#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<ComplianceService>,
    pub config: Arc<AppConfig>,
}

#[derive(Clone)]
pub struct AppConfig {
    /// Bearer token required under `/api/v1`. `None` locks the scope.
    pub api_token: Option<String>,
    pub max_body_bytes: usize,
    pub enable_compression: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            api_token: None,
            max_body_bytes: 262_144, // 256KB
            enable_compression: true,
        }
    }
}

impl ApiState {
    pub fn new(service: Arc<ComplianceService>, config: AppConfig) -> Self {
        ApiState {
            service,
            config: Arc::new(config),
        }
    }

    /// Builds the HTTP config from the service settings.
    pub fn from_service(service: Arc<ComplianceService>) -> Self {
        let config = AppConfig {
            api_token: service.settings().api_token.clone(),
            ..AppConfig::default()
        };
        Self::new(service, config)
    }
}
