pub mod client;
pub mod config;
pub mod metrics;
pub mod room;
pub mod signaling;
pub mod types;
pub mod utils;

pub use client::{MeshCoordinator, MeshEvent};
pub use room::{Room, RosterStore};
pub use signaling::{MessageHandler, SignalCodec, SignalingRelay, SignalingServer};
pub use utils::{Error, Result};
