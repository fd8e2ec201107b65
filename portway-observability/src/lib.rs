pub mod logger;
pub mod metrics;
pub mod traffic_log;

pub use metrics::GatewayMetrics;
pub use traffic_log::{TrafficLog, TrafficLogEntry, TrafficOutcome};
