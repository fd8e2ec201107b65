pub mod executor;
pub mod pool;
pub mod webhook;

pub use executor::{CollectionResult, SqlExecutor};
pub use pool::EnvironmentPools;
pub use webhook::WebhookIngester;
