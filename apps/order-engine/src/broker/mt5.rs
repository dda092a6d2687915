//! MT5 bridge adapter.
//!
//! Talks HTTP/JSON to a bridge service running next to an MT5 terminal. One
//! attempt per call and no retry loop: a failed call surfaces as
//! [`BrokerError`] and the engine decides whether a later signal retries
//! with a fresh client order id.
//!
//! The client order id rides in the order comment; that comment is what the
//! reconciler later matches deal history against.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{BrokerError, BrokerGateway};
use crate::config::Mt5Config;
use crate::models::{
    Deal, OpenOrder, OrderRequest, OrderResult, Position, Side, SymbolInfo, Tick,
};

/// HTTP adapter for an MT5 bridge terminal.
pub struct Mt5BridgeBroker {
    client: Client,
    base_url: String,
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct PlaceOrderBody<'a> {
    client_order_id: &'a str,
    symbol: &'a str,
    side: &'a str,
    qty: Decimal,
    order_type: &'a str,
    price: Option<Decimal>,
    sl: Option<Decimal>,
    tp: Option<Decimal>,
    /// MT5 order comment; carries the client order id for reconciliation.
    comment: &'a str,
}

#[derive(Debug, Deserialize)]
struct OrderResultDto {
    accepted: bool,
    broker_order_id: Option<String>,
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PositionDto {
    ticket: String,
    #[serde(default)]
    comment: String,
    symbol: String,
    side: String,
    volume: Decimal,
    entry_price: Decimal,
    open_time: DateTime<Utc>,
    sl: Option<Decimal>,
    tp: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct DealDto {
    ticket: String,
    #[serde(default)]
    comment: String,
    symbol: String,
    side: String,
    volume: Decimal,
    price: Decimal,
    time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct OpenOrderDto {
    ticket: String,
    #[serde(default)]
    comment: String,
    symbol: String,
}

#[derive(Debug, Deserialize)]
struct TickDto {
    bid: Decimal,
    ask: Decimal,
}

#[derive(Debug, Deserialize)]
struct SymbolInfoDto {
    tick_size: Decimal,
    tick_value: Decimal,
    volume_min: Decimal,
    volume_max: Decimal,
    volume_step: Decimal,
}

#[derive(Debug, Deserialize)]
struct AccountDto {
    equity: Decimal,
}

#[derive(Debug, Deserialize)]
struct AtrDto {
    atr: Decimal,
}

#[derive(Debug, Deserialize)]
struct ConnectedDto {
    connected: bool,
}

#[derive(Debug, Deserialize)]
struct CancelDto {
    cancelled: bool,
}

fn parse_side(s: &str) -> Result<Side, BrokerError> {
    s.parse()
        .map_err(|_| BrokerError::Protocol(format!("unknown side '{s}' in bridge response")))
}

// ============================================================================
// Adapter
// ============================================================================

impl Mt5BridgeBroker {
    /// Build an adapter from configuration.
    pub fn new(config: &Mt5Config) -> Result<Self, BrokerError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| BrokerError::Unreachable(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, BrokerError> {
        let url = format!("{}{path}", self.base_url);
        debug!(%url, "bridge GET");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BrokerError::Unreachable(e.to_string()))?;
        Self::decode(response).await
    }

    async fn post<T: serde::de::DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, BrokerError> {
        let url = format!("{}{path}", self.base_url);
        debug!(%url, "bridge POST");
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| BrokerError::Unreachable(e.to_string()))?;
        Self::decode(response).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, BrokerError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::Protocol(format!(
                "bridge returned {status}: {body}"
            )));
        }
        response
            .json()
            .await
            .map_err(|e| BrokerError::Protocol(format!("malformed bridge response: {e}")))
    }
}

#[async_trait]
impl BrokerGateway for Mt5BridgeBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        let status: ConnectedDto = self.post("/connect", &serde_json::json!({})).await?;
        if status.connected {
            Ok(())
        } else {
            Err(BrokerError::Unreachable(
                "bridge reports terminal not attached".to_string(),
            ))
        }
    }

    async fn is_connected(&self) -> bool {
        matches!(
            self.get::<ConnectedDto>("/connected").await,
            Ok(ConnectedDto { connected: true })
        )
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResult, BrokerError> {
        let body = PlaceOrderBody {
            client_order_id: &request.client_order_id,
            symbol: &request.symbol,
            side: request.side.as_str(),
            qty: request.qty,
            order_type: request.order_type.as_str(),
            price: request.price,
            sl: request.sl,
            tp: request.tp,
            comment: &request.client_order_id,
        };

        let dto: OrderResultDto = self.post("/orders", &body).await?;
        Ok(OrderResult {
            accepted: dto.accepted,
            broker_order_id: dto.broker_order_id,
            reason: dto.reason,
        })
    }

    async fn cancel(&self, broker_order_id: &str) -> Result<bool, BrokerError> {
        let dto: CancelDto = self
            .post(
                &format!("/orders/{broker_order_id}/cancel"),
                &serde_json::json!({}),
            )
            .await?;
        Ok(dto.cancelled)
    }

    async fn positions(&self) -> Result<Vec<Position>, BrokerError> {
        let dtos: Vec<PositionDto> = self.get("/positions").await?;
        dtos.into_iter()
            .map(|dto| {
                Ok(Position {
                    side: parse_side(&dto.side)?,
                    ticket: dto.ticket,
                    comment: dto.comment,
                    symbol: dto.symbol,
                    volume: dto.volume,
                    entry_price: dto.entry_price,
                    open_time: dto.open_time,
                    sl: dto.sl,
                    tp: dto.tp,
                })
            })
            .collect()
    }

    async fn positions_for(&self, symbol: &str) -> Result<Vec<Position>, BrokerError> {
        let dtos: Vec<PositionDto> = self.get(&format!("/positions?symbol={symbol}")).await?;
        dtos.into_iter()
            .map(|dto| {
                Ok(Position {
                    side: parse_side(&dto.side)?,
                    ticket: dto.ticket,
                    comment: dto.comment,
                    symbol: dto.symbol,
                    volume: dto.volume,
                    entry_price: dto.entry_price,
                    open_time: dto.open_time,
                    sl: dto.sl,
                    tp: dto.tp,
                })
            })
            .collect()
    }

    async fn close_position(
        &self,
        ticket: &str,
        volume: Decimal,
    ) -> Result<OrderResult, BrokerError> {
        let dto: OrderResultDto = self
            .post(
                &format!("/positions/{ticket}/close"),
                &serde_json::json!({ "volume": volume }),
            )
            .await?;
        Ok(OrderResult {
            accepted: dto.accepted,
            broker_order_id: dto.broker_order_id,
            reason: dto.reason,
        })
    }

    async fn open_orders(&self) -> Result<Vec<OpenOrder>, BrokerError> {
        let dtos: Vec<OpenOrderDto> = self.get("/open_orders").await?;
        Ok(dtos
            .into_iter()
            .map(|dto| OpenOrder {
                ticket: dto.ticket,
                comment: dto.comment,
                symbol: dto.symbol,
            })
            .collect())
    }

    async fn history_deals(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        symbol: &str,
    ) -> Result<Vec<Deal>, BrokerError> {
        let path = format!(
            "/deals?symbol={symbol}&from={}&to={}",
            since.to_rfc3339(),
            until.to_rfc3339()
        );
        let dtos: Vec<DealDto> = self.get(&path).await?;
        dtos.into_iter()
            .map(|dto| {
                Ok(Deal {
                    side: parse_side(&dto.side)?,
                    ticket: dto.ticket,
                    comment: dto.comment,
                    symbol: dto.symbol,
                    volume: dto.volume,
                    price: dto.price,
                    time: dto.time,
                })
            })
            .collect()
    }

    async fn symbol_info_tick(&self, symbol: &str) -> Result<Tick, BrokerError> {
        let dto: TickDto = self.get(&format!("/tick/{symbol}")).await?;
        Ok(Tick {
            bid: dto.bid,
            ask: dto.ask,
        })
    }

    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo, BrokerError> {
        let dto: SymbolInfoDto = self.get(&format!("/symbols/{symbol}")).await?;
        Ok(SymbolInfo {
            tick_size: dto.tick_size,
            tick_value: dto.tick_value,
            volume_min: dto.volume_min,
            volume_max: dto.volume_max,
            volume_step: dto.volume_step,
        })
    }

    async fn account_equity(&self) -> Result<Decimal, BrokerError> {
        let dto: AccountDto = self.get("/account").await?;
        Ok(dto.equity)
    }

    async fn atr(
        &self,
        symbol: &str,
        timeframe_min: u32,
        period: u32,
    ) -> Result<Decimal, BrokerError> {
        let dto: AtrDto = self
            .get(&format!(
                "/atr?symbol={symbol}&timeframe={timeframe_min}&period={period}"
            ))
            .await?;
        Ok(dto.atr)
    }
}

impl std::fmt::Debug for Mt5BridgeBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mt5BridgeBroker")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}
