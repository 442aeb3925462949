pub mod config;
pub mod consumer;
pub mod error;
pub mod llm;
pub mod models;
pub mod providers;
pub mod server;
pub mod sse;
pub mod store;
pub mod telemetry;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::config;
    pub use crate::consumer;
    pub use crate::error::RelayError;
    pub use crate::llm;
    pub use crate::models::{Conversation, Message, Role};
    pub use crate::providers::ProviderId;
    pub use crate::server;
    pub use crate::store;
    pub use crate::telemetry;
}
