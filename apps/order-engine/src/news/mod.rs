//! Economic news calendar.
//!
//! The safety gate holds trading around high-impact calendar events. The
//! calendar is a port: the engine ships a Trading Economics HTTP client and
//! a disabled no-op. A feed error is treated as "no news"; the gate never
//! blocks trading on calendar infrastructure problems.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::NewsConfig;

/// Calendar event impact level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NewsImpact {
    /// Major market mover (rate decisions, NFP).
    High,
    /// Moderate mover.
    Medium,
    /// Background noise.
    Low,
}

impl NewsImpact {
    /// Blackout length applied by the risk governor for this impact.
    #[must_use]
    pub const fn blackout_minutes(self) -> u32 {
        match self {
            Self::High => 30,
            Self::Medium => 10,
            Self::Low => 0,
        }
    }
}

impl std::str::FromStr for NewsImpact {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(format!("unknown impact '{other}'")),
        }
    }
}

/// Port for high-impact event lookups.
#[async_trait]
pub trait NewsCalendar: Send + Sync {
    /// Whether any high-impact event for the symbol's country set exists in
    /// `[now - window, now + window]`.
    async fn has_high_impact(&self, symbol: &str, window_min: u32, now: DateTime<Utc>) -> bool;
}

/// Calendar that never reports events (news checks disabled).
#[derive(Debug, Clone, Copy, Default)]
pub struct NewsDisabled;

#[async_trait]
impl NewsCalendar for NewsDisabled {
    async fn has_high_impact(&self, _symbol: &str, _window_min: u32, _now: DateTime<Utc>) -> bool {
        false
    }
}

/// Trading Economics calendar client.
///
/// One bounded attempt per lookup; no retries. The gate runs inline with
/// signal handling, so the request timeout caps the pipeline stall.
pub struct TradingEconomicsCalendar {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

/// Request timeout for calendar lookups.
const CALENDAR_TIMEOUT: Duration = Duration::from_secs(8);

impl TradingEconomicsCalendar {
    /// Build a calendar client from configuration.
    pub fn new(config: &NewsConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(CALENDAR_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    /// Countries whose calendars move the given symbol.
    fn countries_for(symbol: &str) -> &'static [&'static str] {
        match symbol {
            "EURUSD" => &["Euro Area", "Germany", "France", "Italy", "Spain"],
            "GBPUSD" => &["United Kingdom"],
            // Dollar-denominated metals and the default case follow the US calendar.
            _ => &["United States"],
        }
    }
}

#[async_trait]
impl NewsCalendar for TradingEconomicsCalendar {
    async fn has_high_impact(&self, symbol: &str, window_min: u32, now: DateTime<Utc>) -> bool {
        let window = chrono::Duration::minutes(i64::from(window_min));
        let d1 = (now - window).format("%Y-%m-%dT%H:%M").to_string();
        let d2 = (now + window).format("%Y-%m-%dT%H:%M").to_string();
        let countries = Self::countries_for(symbol).join(",");

        let url = format!(
            "{}/calendar?importance=3&d1={d1}&d2={d2}&c={countries}&format=json",
            self.base_url
        );

        // Trading Economics expects the raw API key in the Authorization header.
        let response = self
            .client
            .get(&url)
            .header("Authorization", &self.api_key)
            .send()
            .await;

        let events: serde_json::Value = match response {
            Ok(resp) => match resp.error_for_status() {
                Ok(resp) => match resp.json().await {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(symbol, error = %e, "news calendar returned malformed body; assuming no news");
                        return false;
                    }
                },
                Err(e) => {
                    warn!(symbol, error = %e, "news calendar rejected request; assuming no news");
                    return false;
                }
            },
            Err(e) => {
                warn!(symbol, error = %e, "news calendar unreachable; assuming no news");
                return false;
            }
        };

        let hit = events.as_array().is_some_and(|a| !a.is_empty());
        debug!(symbol, window_min, hit, "news calendar lookup");
        hit
    }
}

impl std::fmt::Debug for TradingEconomicsCalendar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradingEconomicsCalendar")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}
