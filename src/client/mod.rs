pub mod coordinator;
pub mod media;
pub mod rtc;
pub mod session;
pub mod signaling;
pub mod speaker;
pub mod transport;

pub use coordinator::{MeshCoordinator, MeshEvent};
pub use media::{LocalTrack, MediaDevices, MediaTrackSet, SyntheticDevices, TrackKind, TrackSource};
pub use rtc::RtcTransportFactory;
pub use session::{PeerSession, PeerState, Role, SessionEvent, VideoSwitch};
pub use signaling::SignalingClient;
pub use speaker::{SampleAnalyser, SpeakerDetector};
pub use transport::{PeerTransport, TransportEvent, TransportFactory};
