use shared::frame::FrameError;
use shared::handshake::HandshakeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("engine task failed: {0}")]
    Engine(#[from] tokio::task::JoinError),
}

/// Reasons a single connection ends early. None of these affect other
/// connections.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("peer closed the stream during the handshake")]
    ClosedDuringHandshake,
    #[error("handshake not completed within {0:?}")]
    HandshakeTimeout(std::time::Duration),
    #[error("peer stopped reading, outbound queue full")]
    Backlogged,
    #[error("engine is no longer running")]
    EngineGone,
}
