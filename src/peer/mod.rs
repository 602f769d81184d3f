pub mod connection;
pub mod engine;
pub mod handle;
pub mod ice;
pub mod state;
pub mod types;

pub use connection::RtcPeerFactory;
pub use engine::{NegotiationEngine, TransportOutcome};
pub use handle::{PeerEvent, PeerEventKind, PeerEventSink, PeerFactory, PeerHandle};
pub use state::{NegotiationState, PeerConnectionState, Role};
pub use types::{IceCandidate, SdpKind, ServerConfig, SessionDescription};
