pub mod models;
pub mod parser;


pub use models::{Config, LocationConfig, ServerConfig};
pub use parser::{parse_config, ConfigError};
