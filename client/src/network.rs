use crate::tracker::{SessionView, Update};
use crate::ClientConfig;
use log::{debug, error, info, warn};
use rand::Rng;
use serde_json::json;
use shared::frame::{
    encode_frame, Frame, FrameDecoder, FrameError, Message, MessageAssembler, CLOSE_NORMAL,
    DEFAULT_MAX_PAYLOAD,
};
use shared::handshake::{
    client_request, encode_client_key, parse_response, verify_response, HandshakeError,
};
use shared::{now_millis, ActionRequest, ClientMessage, JoinRequest, ServerMessage};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{interval, timeout, MissedTickBehavior};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("failed to encode message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("host closed the stream")]
    Closed,
}

/// What the host sent us.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Message(ServerMessage),
    Ping(Vec<u8>),
    Close(Option<u16>),
}

/// One upgraded stream to the host.
///
/// `recv` only reads, so it can sit in a `select!` next to timers without
/// losing data when another branch wins.
pub struct Connection<T> {
    stream: T,
    decoder: FrameDecoder,
    assembler: MessageAssembler,
}

impl Connection<TcpStream> {
    pub async fn connect(addr: &str, path: &str) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Self::handshake(stream, addr, path).await
    }
}

impl<T> Connection<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Performs the client half of the opening handshake over `stream`.
    pub async fn handshake(mut stream: T, host: &str, path: &str) -> Result<Self, ClientError> {
        let key = encode_client_key(rand::random());
        stream
            .write_all(client_request(host, path, &key).as_bytes())
            .await?;

        let mut buf = Vec::with_capacity(512);
        loop {
            if let Some((response, used)) = parse_response(&buf)? {
                verify_response(&response, &key)?;
                buf.drain(..used);
                return Ok(Self {
                    stream,
                    decoder: FrameDecoder::with_buffer(buf, DEFAULT_MAX_PAYLOAD),
                    assembler: MessageAssembler::new(DEFAULT_MAX_PAYLOAD),
                });
            }
            if stream.read_buf(&mut buf).await? == 0 {
                return Err(ClientError::Closed);
            }
        }
    }

    pub async fn send(&mut self, message: &ClientMessage) -> Result<(), ClientError> {
        let text = serde_json::to_string(message)?;
        self.send_frame(Frame::text(text)).await
    }

    /// Writes a frame masked with a fresh random key.
    pub async fn send_frame(&mut self, frame: Frame) -> Result<(), ClientError> {
        let bytes = encode_frame(&frame, Some(rand::random()));
        self.stream.write_all(&bytes).await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<Incoming, ClientError> {
        let mut chunk = [0u8; 4096];

        loop {
            while let Some(frame) = self.decoder.next_frame()? {
                match self.assembler.push(frame)? {
                    Some(Message::Text(bytes)) => match serde_json::from_slice(&bytes) {
                        Ok(message) => return Ok(Incoming::Message(message)),
                        Err(e) => warn!("Ignoring unreadable message from host: {}", e),
                    },
                    Some(Message::Ping(payload)) => return Ok(Incoming::Ping(payload)),
                    Some(Message::Close(code)) => return Ok(Incoming::Close(code)),
                    Some(Message::Binary(_) | Message::Pong(_) | Message::Unknown(_)) | None => {}
                }
            }

            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(ClientError::Closed);
            }
            self.decoder.extend(&chunk[..n]);
        }
    }

    /// Sends a close and waits up to `wait` for the host's echo.
    pub async fn close(&mut self, code: u16, wait: Duration) -> Result<(), ClientError> {
        self.send_frame(Frame::close(Some(code))).await?;

        let echoed = timeout(wait, async {
            loop {
                match self.recv().await {
                    Ok(Incoming::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        if echoed.is_err() {
            debug!("Host did not echo our close within {:?}", wait);
        }

        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Probe client: joins, keeps the clock in sync and logs what the host sends.
pub struct Client {
    config: ClientConfig,
    view: SessionView,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            view: SessionView::new(),
        }
    }

    pub fn view(&self) -> &SessionView {
        &self.view
    }

    pub async fn run(&mut self) -> Result<(), ClientError> {
        info!("Connecting to {}{}", self.config.server, self.config.path);
        let mut connection = Connection::connect(&self.config.server, &self.config.path).await?;

        connection
            .send(&ClientMessage::Join(JoinRequest {
                name: self.config.name.clone(),
                avatar: self.config.avatar.clone(),
                secret: self.config.secret.clone(),
            }))
            .await?;

        let mut ping_interval = interval(self.config.ping_interval);
        ping_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let action_period = self.config.action_interval.unwrap_or(Duration::from_secs(3600));
        let mut action_interval = interval(action_period);
        action_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let can_act = self.config.action_interval.is_some() && self.view.player_id.is_some();

            tokio::select! {
                incoming = connection.recv() => match incoming? {
                    Incoming::Message(message) => self.handle_message(message),
                    Incoming::Ping(payload) => connection.send_frame(Frame::pong(payload)).await?,
                    Incoming::Close(code) => {
                        info!("Host closed the connection ({:?})", code);
                        connection.send_frame(Frame::close(None)).await?;
                        return Ok(());
                    }
                },

                _ = ping_interval.tick() => {
                    let probe = self.view.probe(now_millis());
                    connection.send(&probe).await?;
                },

                _ = action_interval.tick(), if can_act => {
                    let amount: i64 = rand::thread_rng().gen_range(1..=10);
                    connection
                        .send(&ClientMessage::Action(ActionRequest {
                            kind: "ADD_POINTS".to_string(),
                            payload: Some(json!({ "amount": amount })),
                        }))
                        .await?;
                },

                _ = tokio::signal::ctrl_c() => {
                    info!("Leaving session");
                    connection.close(CLOSE_NORMAL, Duration::from_secs(1)).await?;
                    return Ok(());
                },
            }
        }
    }

    fn handle_message(&mut self, message: ServerMessage) {
        match self.view.apply(message, now_millis()) {
            Update::Joined {
                player_id,
                reconnected,
            } => {
                info!(
                    "{} as {} ({} players)",
                    if reconnected { "Reconnected" } else { "Joined" },
                    player_id,
                    self.view.player_count()
                );
            }
            Update::State { actions } => {
                info!(
                    "State update #{}: {} ({} players)",
                    self.view.updates,
                    if actions.is_empty() {
                        "no actions".to_string()
                    } else {
                        actions.join(", ")
                    },
                    self.view.player_count()
                );
            }
            Update::Clock(sample) => {
                debug!(
                    "Clock sample: rtt {:.1} ms, offset {:.1} ms, host clock ~{:.0}",
                    sample.rtt,
                    sample.offset,
                    self.view.host_time(now_millis()).unwrap_or_default()
                );
            }
            Update::Rejected(error) => {
                error!("Host rejected a message: {:?} {}", error.code, error.message);
            }
            Update::Ignored => {}
        }
    }
}
