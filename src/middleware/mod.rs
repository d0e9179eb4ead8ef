pub mod errors;
pub mod logging;
pub mod metrics;

pub use errors::error_envelope;
pub use logging::RequestLogging;
pub use metrics::MetricsMiddleware;
