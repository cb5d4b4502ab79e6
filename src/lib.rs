pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod logger;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;
mod utils;

pub use config::CallConfig;
pub use controller::{CallController, CallDeps};
pub use error::{CallError, CallResult, ErrorKind, SignalingStep};
pub use events::{CallEvent, Destination, EventBus, Notification, Severity};
pub use peer::ConnectionState;
pub use session::{Access, CallSnapshot, CallTarget, CallTargetId};
pub use signaling::{HttpSignaling, SessionToken, Signaling};
