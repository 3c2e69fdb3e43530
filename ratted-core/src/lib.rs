//! ratted.systems upload protocol.
//! Large files go over a persistent socket: authenticate, solve a proof-of-work gate, then
//! stream server-paced chunks until the upload link arrives.

pub mod channel;
pub mod chunk;
pub mod config;
pub mod error;
pub mod pow;
pub mod progress;
pub mod protocol;
pub mod session;
pub mod token;
pub mod wire;

#[cfg(test)]
mod memory;

pub use channel::{ChannelError, Frame, FrameTransport, FramedMessageChannel, WsTransport};
pub use chunk::UploadSource;
pub use config::EndpointConfig;
pub use error::UploadError;
pub use pow::{PowError, Puzzle};
pub use progress::{NoProgress, ProgressEvent, ProgressReporter, ProgressSink};
pub use protocol::{Envelope, LARGE_FILE_THRESHOLD};
pub use session::{upload_file, ChunkedUploadSession, SessionState, UploadOutcome};
pub use token::{StaticToken, TokenProvider};
