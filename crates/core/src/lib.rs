pub mod config;
pub mod dispatch;
pub mod errors;
pub mod logging;
pub mod models;
pub mod traits;

pub use config::AppConfig;
pub use dispatch::BackgroundDispatcher;
pub use errors::{OrchestratorError, OrchestratorResult};
pub use logging::init_logging;
pub use models::*;
pub use traits::*;
