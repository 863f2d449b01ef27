//! Corporate disclosure collector.
//!
//! Two upstream sources: "dart" (requires an API key) and "krx". The
//! source is a task parameter, so one registration serves both.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Deserialize;
use tracing::info;

use stockpile_scheduler::{CollectError, Collector, CollectionType, Payload, StoredOutput};

use crate::fetch::{extract_records, ApiClient};
use crate::sink::JsonFileSink;

#[derive(Debug, Deserialize)]
struct DisclosureParams {
    #[serde(default = "default_source")]
    source: String,
    corp_code: Option<String>,
    disclosure_type: Option<String>,
    /// Overrides the configured key for this task only.
    api_key: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
}

fn default_source() -> String {
    "dart".into()
}

pub struct DisclosureCollector {
    client: ApiClient,
    sink: JsonFileSink,
    api_key: String,
    parameters: serde_json::Value,
}

struct ResolvedParams {
    source: String,
    corp_code: Option<String>,
    disclosure_type: Option<String>,
    api_key: String,
    start: String,
    end: String,
}

impl DisclosureCollector {
    pub fn new(
        client: ApiClient,
        sink: JsonFileSink,
        api_key: String,
        parameters: serde_json::Value,
    ) -> Self {
        Self { client, sink, api_key, parameters }
    }

    fn params(&self) -> Result<ResolvedParams, CollectError> {
        let p: DisclosureParams = serde_json::from_value(self.parameters.clone())
            .map_err(|e| CollectError::Permanent(format!("invalid parameters: {e}")))?;
        let api_key = p
            .api_key
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| self.api_key.clone());
        match p.source.as_str() {
            "dart" => {
                if api_key.is_empty() {
                    return Err(CollectError::Permanent(
                        "source 'dart' requires an API key".into(),
                    ));
                }
            }
            "krx" => {}
            other => {
                return Err(CollectError::Permanent(format!(
                    "unsupported disclosure source '{other}'"
                )));
            }
        }
        let today = Utc::now().date_naive();
        Ok(ResolvedParams {
            source: p.source,
            corp_code: p.corp_code.filter(|s| !s.is_empty()),
            disclosure_type: p.disclosure_type.filter(|s| !s.is_empty()),
            api_key,
            start: p
                .start_date
                .unwrap_or_else(|| (today - Duration::days(7)).to_string()),
            end: p.end_date.unwrap_or_else(|| today.to_string()),
        })
    }
}

#[async_trait]
impl Collector for DisclosureCollector {
    fn collection_type(&self) -> CollectionType {
        CollectionType::Disclosure
    }

    async fn collect(&self) -> Result<Payload, CollectError> {
        let p = self.params()?;
        info!(source = p.source, start = p.start, end = p.end, "Collecting disclosures");
        let mut query = vec![
            ("source", p.source.clone()),
            ("start_date", p.start),
            ("end_date", p.end),
        ];
        if let Some(corp_code) = p.corp_code {
            query.push(("corp_code", corp_code));
        }
        if let Some(kind) = p.disclosure_type {
            query.push(("disclosure_type", kind));
        }
        if p.source == "dart" {
            query.push(("api_key", p.api_key));
        }
        let body = self.client.get_json("/disclosures", &query).await?;
        extract_records(body)
    }

    async fn store(&self, payload: Payload) -> Result<StoredOutput, CollectError> {
        if payload.is_empty() {
            return Ok(StoredOutput::empty());
        }
        let p = self.params()?;
        let location = self.sink.write("disclosure", &payload).await?;
        Ok(StoredOutput {
            storage_location: Some(location),
            metadata: serde_json::json!({
                "count": payload.len(),
                "source": p.source,
                "start_date": p.start,
                "end_date": p.end,
            }),
        })
    }
}
