pub mod manager;

pub use manager::{AgentConfig, Config, ConfigError, ConfigManager, ProviderConfig, ResolvedProvider};
