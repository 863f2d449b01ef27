//! Daily price history collector.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Deserialize;
use tracing::info;

use stockpile_scheduler::{CollectError, Collector, CollectionType, Payload, StoredOutput};

use crate::fetch::{extract_records, ApiClient};
use crate::sink::JsonFileSink;

/// Accepted task parameters. `symbol` is mandatory; the date range
/// defaults to the last seven days.
#[derive(Debug, Deserialize)]
struct PriceParams {
    symbol: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
    #[serde(default = "default_interval")]
    interval: String,
}

fn default_interval() -> String {
    "1d".into()
}

pub struct StockPriceCollector {
    client: ApiClient,
    sink: JsonFileSink,
    parameters: serde_json::Value,
}

impl StockPriceCollector {
    pub fn new(client: ApiClient, sink: JsonFileSink, parameters: serde_json::Value) -> Self {
        Self { client, sink, parameters }
    }

    fn params(&self) -> Result<(String, String, String, String), CollectError> {
        let p: PriceParams = serde_json::from_value(self.parameters.clone())
            .map_err(|e| CollectError::Permanent(format!("invalid parameters: {e}")))?;
        let symbol = p
            .symbol
            .filter(|s| !s.is_empty())
            .ok_or_else(|| CollectError::Permanent("missing required parameter 'symbol'".into()))?;
        let today = Utc::now().date_naive();
        let end = p.end_date.unwrap_or_else(|| today.to_string());
        let start = p
            .start_date
            .unwrap_or_else(|| (today - Duration::days(7)).to_string());
        Ok((symbol, start, end, p.interval))
    }
}

#[async_trait]
impl Collector for StockPriceCollector {
    fn collection_type(&self) -> CollectionType {
        CollectionType::StockPrice
    }

    async fn collect(&self) -> Result<Payload, CollectError> {
        let (symbol, start, end, interval) = self.params()?;
        info!(symbol, start, end, "Collecting stock prices");
        let body = self
            .client
            .get_json(
                &format!("/stocks/{symbol}/prices"),
                &[
                    ("start_date", start),
                    ("end_date", end),
                    ("interval", interval),
                ],
            )
            .await?;
        extract_records(body)
    }

    async fn store(&self, payload: Payload) -> Result<StoredOutput, CollectError> {
        if payload.is_empty() {
            return Ok(StoredOutput::empty());
        }
        let (symbol, start, end, _) = self.params()?;
        let location = self.sink.write("stock_price", &payload).await?;
        Ok(StoredOutput {
            storage_location: Some(location),
            metadata: serde_json::json!({
                "count": payload.len(),
                "symbol": symbol,
                "start_date": start,
                "end_date": end,
            }),
        })
    }
}
