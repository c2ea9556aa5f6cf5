// Network layer module
// Line-delimited JSON over TCP between the tracking source and the controller

pub mod connection;
pub mod messages;
pub mod simulator;
pub mod stream_client;

pub use connection::Connection;
pub use messages::{ClientCommand, HandshakeRequest, HandshakeResponse, StreamMessage};
pub use simulator::{SimulatorConfig, TrackingSimulator};
pub use stream_client::{ConnectionState, SessionDescriptor, StreamEvent, TrackingStreamClient};
