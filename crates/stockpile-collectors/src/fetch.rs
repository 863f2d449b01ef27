//! Shared HTTP fetch helper for the collectors.

use std::time::Duration;

use stockpile_scheduler::CollectError;

/// Thin wrapper over a shared reqwest client: one GET, JSON response,
/// failures mapped onto the collector error taxonomy.
#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// GET `base_url + path` with query parameters, parsed as JSON.
    ///
    /// Connection errors, timeouts, 429 and 5xx are transient; any other
    /// non-2xx status means the request itself is wrong and will not
    /// improve on retry.
    pub async fn get_json(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<serde_json::Value, CollectError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| CollectError::Transient(format!("request to {url} failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let msg = format!("{url} returned {status}: {text}");
            return if status.as_u16() == 429 || status.is_server_error() {
                Err(CollectError::Transient(msg))
            } else {
                Err(CollectError::Permanent(msg))
            };
        }

        resp.json()
            .await
            .map_err(|e| CollectError::Transient(format!("invalid JSON from {url}: {e}")))
    }
}

/// Pull the array of records out of a response body. Accepts either a bare
/// array or an object with a `data` array; anything else is an upstream
/// contract violation.
pub fn extract_records(body: serde_json::Value) -> Result<Vec<serde_json::Value>, CollectError> {
    match body {
        serde_json::Value::Array(items) => Ok(items),
        serde_json::Value::Object(mut map) => match map.remove("data") {
            Some(serde_json::Value::Array(items)) => Ok(items),
            Some(other) => Ok(vec![other]),
            None => Err(CollectError::Permanent(
                "response has no 'data' field".into(),
            )),
        },
        other => Err(CollectError::Permanent(format!(
            "unexpected response shape: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_records_shapes() {
        let arr = serde_json::json!([{"a": 1}, {"a": 2}]);
        assert_eq!(extract_records(arr).unwrap().len(), 2);

        let wrapped = serde_json::json!({"data": [{"a": 1}]});
        assert_eq!(extract_records(wrapped).unwrap().len(), 1);

        let single = serde_json::json!({"data": {"a": 1}});
        assert_eq!(extract_records(single).unwrap().len(), 1);

        assert!(extract_records(serde_json::json!({"other": 1})).is_err());
        assert!(extract_records(serde_json::json!("nope")).is_err());
    }
}
