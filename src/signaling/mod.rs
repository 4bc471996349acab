pub mod codec;
pub mod handler;
pub mod http;
pub mod ice;
pub mod messages;
pub mod relay;
pub mod server;

pub use codec::SignalCodec;
pub use handler::MessageHandler;
pub use messages::{ClientMessage, ServerMessage};
pub use relay::SignalingRelay;
pub use server::SignalingServer;
