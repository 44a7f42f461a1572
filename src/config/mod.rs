pub mod schema;

pub use schema::{
    BurstConfig, Config, GatewayConfig, MessagingConfig, ResponderConfig, StorageConfig,
};
