pub mod connection;
pub mod database;
pub mod in_memory_queue;
pub mod message_queue;
pub mod message_queue_factory;
pub mod redis_stream;

pub use connection::{connect_with_policy, RabbitMqConnection, ReconnectPolicy, RedisConnection};
pub use database::{InMemoryClusterStore, SqliteClusterStore, SqliteDatabase};
pub use in_memory_queue::InMemoryBroker;
pub use message_queue::RabbitMqBroker;
pub use message_queue_factory::{BrokerFactory, BrokerHandle};
pub use redis_stream::RedisStreamBroker;
