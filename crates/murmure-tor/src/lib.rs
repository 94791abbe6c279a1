// Transport layer: control-channel orchestration for the anonymizing
// network, hidden-service publication, and the observable runtime state.

pub mod control;
pub mod hs_keys;
pub mod orchestrator;
pub mod state;

mod error;

pub use control::{AddOnionReply, BootstrapPhase, ControlClient};
pub use error::TorError;
pub use orchestrator::{TorConfig, TorOrchestrator};
pub use state::{TorErrorCode, TorState};
