pub mod config;
pub mod contacts;
pub mod context;
pub mod inbound;
pub mod ingress;
pub mod invite;
pub mod outbound;
pub mod prefs;
pub mod replay;
pub mod supervisor;
pub mod vault;

mod error;
mod util;

pub use config::NodeConfig;
pub use context::NodeContext;
pub use error::{ErrorCode, NodeError, Rejection};
pub use outbound::SendOutcome;
pub use supervisor::Supervisor;
