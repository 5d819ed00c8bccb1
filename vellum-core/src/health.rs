//! Index health reporting
//!
//! Every backend reports its health through the same type so the surrounding
//! repository service can aggregate them without knowing which backend is in use.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Health status for an index instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Ready and serving
    Healthy,
    /// Serving, but a best-effort concern (e.g. pending persistence) exists
    Degraded,
    /// Not serving
    Unhealthy,
    /// Not yet started
    Unknown,
}

/// Health check result for one index instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    /// Backend name
    pub component: String,
    pub message: Option<String>,
    /// Round-trip time of the probe in milliseconds (if one was made)
    pub response_time_ms: Option<i64>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl HealthCheck {
    pub fn healthy(component: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Healthy,
            component: component.into(),
            message: None,
            response_time_ms: None,
            metadata: None,
        }
    }

    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            ..Self::healthy(component)
        }
    }

    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            ..Self::healthy(component)
        }
    }

    pub fn unknown(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unknown,
            message: Some(message.into()),
            ..Self::healthy(component)
        }
    }

    pub fn with_response_time(mut self, ms: i64) -> Self {
        self.response_time_ms = Some(ms);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value);
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}
