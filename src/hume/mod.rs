//! Voice-AI side of the bridge: the HumeAI EVI chat socket.

pub mod connector;
pub mod messages;
pub mod session;

pub use connector::HumeConnector;
pub use messages::{InboundEvent, SessionSettings};
pub use session::{SessionError, SessionManager, SessionRequest, VoiceEvents, VoiceSession};
