//! # Stockpile Collectors
//!
//! Concrete collectors behind the scheduler's registry: stock prices,
//! company profiles, and corporate disclosures. Fetched payloads land as
//! JSON files under the configured data directory.
//!
//! Collection types without a collector here (news, trading trends,
//! quarterly revenue, market indices) stay schedulable; tasks for them
//! fail as configuration errors until a collector is registered.

pub mod disclosure;
pub mod fetch;
pub mod sink;
pub mod stock_info;
pub mod stock_price;

pub use disclosure::DisclosureCollector;
pub use fetch::ApiClient;
pub use sink::JsonFileSink;
pub use stock_info::StockInfoCollector;
pub use stock_price::StockPriceCollector;

use stockpile_core::CollectorsConfig;
use stockpile_scheduler::{CollectionType, CollectorRegistry};

/// Build the registry of built-in collectors from configuration.
pub fn builtin_registry(config: &CollectorsConfig) -> CollectorRegistry {
    let client = ApiClient::new(&config.stock_api_base_url, config.http_timeout_secs);
    let sink = JsonFileSink::new(
        shellexpand::tilde(&config.data_dir).into_owned(),
    );
    let api_key = config.stock_api_key.clone();

    let mut registry = CollectorRegistry::new();
    {
        let client = client.clone();
        let sink = sink.clone();
        registry.register(CollectionType::StockPrice, move |params| {
            Box::new(StockPriceCollector::new(client.clone(), sink.clone(), params))
        });
    }
    {
        let client = client.clone();
        let sink = sink.clone();
        registry.register(CollectionType::StockInfo, move |params| {
            Box::new(StockInfoCollector::new(client.clone(), sink.clone(), params))
        });
    }
    registry.register(CollectionType::Disclosure, move |params| {
        Box::new(DisclosureCollector::new(
            client.clone(),
            sink.clone(),
            api_key.clone(),
            params,
        ))
    });
    registry
}
