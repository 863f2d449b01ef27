//! Company profile collector. One record per run.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use stockpile_scheduler::{CollectError, Collector, CollectionType, Payload, StoredOutput};

use crate::fetch::ApiClient;
use crate::sink::JsonFileSink;

#[derive(Debug, Deserialize)]
struct InfoParams {
    symbol: Option<String>,
}

pub struct StockInfoCollector {
    client: ApiClient,
    sink: JsonFileSink,
    parameters: serde_json::Value,
}

impl StockInfoCollector {
    pub fn new(client: ApiClient, sink: JsonFileSink, parameters: serde_json::Value) -> Self {
        Self { client, sink, parameters }
    }

    fn symbol(&self) -> Result<String, CollectError> {
        let p: InfoParams = serde_json::from_value(self.parameters.clone())
            .map_err(|e| CollectError::Permanent(format!("invalid parameters: {e}")))?;
        p.symbol
            .filter(|s| !s.is_empty())
            .ok_or_else(|| CollectError::Permanent("missing required parameter 'symbol'".into()))
    }
}

#[async_trait]
impl Collector for StockInfoCollector {
    fn collection_type(&self) -> CollectionType {
        CollectionType::StockInfo
    }

    async fn collect(&self) -> Result<Payload, CollectError> {
        let symbol = self.symbol()?;
        info!(symbol, "Collecting stock info");
        let body = self
            .client
            .get_json(&format!("/stocks/{symbol}/info"), &[])
            .await?;
        // Profile endpoint returns one object, not a series.
        match body {
            serde_json::Value::Null => Ok(Vec::new()),
            serde_json::Value::Array(items) => Ok(items),
            other => Ok(vec![other]),
        }
    }

    async fn store(&self, payload: Payload) -> Result<StoredOutput, CollectError> {
        if payload.is_empty() {
            return Ok(StoredOutput::empty());
        }
        let symbol = self.symbol()?;
        let location = self.sink.write("stock_info", &payload).await?;
        Ok(StoredOutput {
            storage_location: Some(location),
            metadata: serde_json::json!({
                "count": payload.len(),
                "symbol": symbol,
            }),
        })
    }
}
