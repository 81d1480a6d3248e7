pub mod app_config;
pub mod cluster_node;
pub mod message_queue;
pub mod observability;

pub use app_config::{AppConfig, ENV_PREFIX};
pub use cluster_node::{ClusterConfig, LauncherType, NodeConfig, StoreType};
pub use message_queue::{BrokerConfig, BrokerType, ConsumerConfig, RedisConfig};
pub use observability::ObservabilityConfig;
