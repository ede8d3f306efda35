//! Configuration merge system
//!
//! Four layers, later wins:
//! 1. Built-in defaults
//! 2. Host config (~/.config/eo-custody/config.toml)
//! 3. Project config (./eo-custody.toml)
//! 4. CLI flags

mod defaults;
mod effective;
mod merge;

pub use defaults::PipelineSettings;
pub use effective::{
    default_host_config_path, ConfigError, ConfigOrigin, ConfigSource, EffectiveConfig,
    PROJECT_CONFIG_FILE,
};
pub use merge::{deep_merge, merge_layers};
