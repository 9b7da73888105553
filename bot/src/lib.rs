pub mod analysis;
pub mod config;
pub mod logging;
pub mod metrics;
pub mod model_registry;
pub mod oracle;
pub mod pipeline;
pub mod platform;
pub mod policy;
pub mod position;
pub mod record;
pub mod session;
pub mod store;
pub mod trainer;
