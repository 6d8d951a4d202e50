//! Protocol layer (§4.E-§4.G): connection scheme parsing, pluggable
//! transports, stream buffering/framing, and the per-device state machine.

pub mod driver;
pub mod engine;
pub mod framing;
pub mod options;

pub use driver::{build_transport, RawChunk, Transport};
pub use engine::ProtocolEngine;
pub use framing::{split_frames, FrameAssembler};
pub use options::{ConnectionOptions, Scheme};
