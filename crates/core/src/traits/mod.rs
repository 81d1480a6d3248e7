pub mod job_handler;
pub mod message_queue;
pub mod node;
pub mod repository;

pub use job_handler::*;
pub use message_queue::*;
pub use node::*;
pub use repository::*;
