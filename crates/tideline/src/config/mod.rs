//! Engine configuration.

pub mod settings;

pub use settings::{
    EngineSettings, RetrySettings, ENV_MAX_CONCURRENT, ENV_REFRESH_INTERVAL, MAX_BACKOFF_MS,
    MAX_RETRY_LIMIT,
};
