//! Alignment service client
//!
//! The alignment score for a goal is computed by an external module;
//! this client only fetches it. Any failure (module disabled, network
//! error, bad payload) degrades to `None` - an impact read never fails
//! because the collaborator is down.

use gtp_common::config::load_module_config;
use gtp_common::db::settings::get_setting_or;
use serde::Deserialize;
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct AlignmentResponse {
    alignment: f64,
}

/// HTTP client for the alignment_service module
#[derive(Clone)]
pub struct AlignmentClient {
    http: reqwest::Client,
    base_url: Option<String>,
}

impl AlignmentClient {
    /// Client with no upstream configured; every lookup returns `None`
    pub fn disabled() -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: None,
        }
    }

    /// Build from the module_config table
    ///
    /// A missing or disabled alignment_service entry yields a disabled
    /// client rather than an error.
    pub async fn from_module_config(pool: &SqlitePool) -> Self {
        let timeout_ms = get_setting_or(pool, "alignment_request_timeout_ms", 5000u64).await;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build alignment HTTP client: {}; using defaults", e);
                reqwest::Client::new()
            });

        let base_url = match load_module_config(pool, "alignment_service").await {
            Ok(cfg) if cfg.enabled => Some(format!("http://{}:{}", cfg.host, cfg.port)),
            Ok(_) => {
                warn!("alignment_service is disabled; alignment scores unavailable");
                None
            }
            Err(e) => {
                warn!("alignment_service not configured: {}", e);
                None
            }
        };

        Self { http, base_url }
    }

    /// Current alignment score for a goal, when the service can provide one
    pub async fn goal_alignment(&self, goal_id: Uuid) -> Option<f64> {
        let base = self.base_url.as_ref()?;
        let url = format!("{}/alignment/goals/{}", base, goal_id);

        match self.http.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                match resp.json::<AlignmentResponse>().await {
                    Ok(body) => Some(body.alignment),
                    Err(e) => {
                        warn!("Invalid alignment payload for goal {}: {}", goal_id, e);
                        None
                    }
                }
            }
            Ok(resp) => {
                warn!("Alignment service returned {} for goal {}", resp.status(), goal_id);
                None
            }
            Err(e) => {
                warn!("Alignment request failed for goal {}: {}", goal_id, e);
                None
            }
        }
    }
}
