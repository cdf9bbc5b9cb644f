//! Server network layer: TCP listener, opening handshake and per-connection
//! reader/writer tasks.

use crate::config::ServerConfig;
use crate::engine::{ConnectionOutlet, Engine, EngineEvent, EngineHandle, Outbound, SessionMessage};
use crate::error::{ConnectionError, ServerError};
use crate::pipeline::Pipeline;
use crate::session::ConnectionId;
use crate::time_sync;
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use shared::frame::{encode_frame, Frame, FrameDecoder, Message, MessageAssembler};
use shared::handshake::{self, HandshakeError};
use shared::{now_millis, ClientMessage, ErrorCode, ServerMessage};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep_until, timeout, Duration, Instant};

const READ_CHUNK: usize = 4096;

/// Accepts connections and feeds them to a single engine task.
pub struct Server<S> {
    listener: TcpListener,
    config: Arc<ServerConfig>,
    engine: Engine<S>,
}

impl<S> Server<S>
where
    S: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub async fn bind(config: ServerConfig, pipeline: Pipeline<S>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        info!(
            "Server listening on {} at path {}",
            listener.local_addr()?,
            config.path
        );

        let engine = Engine::new(&config, pipeline);
        Ok(Server {
            listener,
            config: Arc::new(config),
            engine,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handle(&self) -> EngineHandle {
        self.engine.handle()
    }

    /// Accepts connections until the engine stops.
    pub async fn run(self) -> Result<(), ServerError> {
        let Server {
            listener,
            config,
            engine,
        } = self;
        let handle = engine.handle();
        let mut engine_task = tokio::spawn(engine.run());
        let mut next_connection_id: ConnectionId = 1;

        loop {
            tokio::select! {
                result = &mut engine_task => {
                    result?;
                    info!("Server stopped");
                    return Ok(());
                },

                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let connection_id = next_connection_id;
                        next_connection_id += 1;
                        debug!("Accepted {} as connection {}", addr, connection_id);

                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Could not disable Nagle for {}: {}", addr, e);
                        }

                        let config = Arc::clone(&config);
                        let engine = handle.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, connection_id, config, engine).await {
                                warn!("Connection {} from {} failed: {}", connection_id, addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
            }
        }
    }
}

/// Drives one connection from handshake to close.
pub async fn handle_connection<T>(
    stream: T,
    connection_id: ConnectionId,
    config: Arc<ServerConfig>,
    engine: EngineHandle,
) -> Result<(), ConnectionError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let handshake = accept_handshake(&mut reader, &mut writer, &config.path);
    let accepted = match timeout(config.handshake_timeout, handshake).await {
        Ok(result) => result?,
        Err(_) => return Err(ConnectionError::HandshakeTimeout(config.handshake_timeout)),
    };
    let Some(leftover) = accepted else {
        return Ok(());
    };

    let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
    let outlet = ConnectionOutlet::new(connection_id, outbound_tx, Arc::new(Notify::new()));
    if !engine.send(EngineEvent::Connected {
        connection_id,
        outlet: outlet.clone(),
    }) {
        return Err(ConnectionError::EngineGone);
    }

    let closing = Arc::new(Notify::new());
    let mut writer_task = tokio::spawn(write_loop(writer, outbound_rx, Arc::clone(&closing)));

    let result = read_loop(
        &mut reader,
        leftover,
        connection_id,
        &config,
        &engine,
        &outlet,
        &closing,
    )
    .await;

    if !engine.send(EngineEvent::Disconnected { connection_id }) {
        debug!("Engine gone before connection {} closed", connection_id);
    }
    drop(outlet);

    // The writer ends once the engine drops its outlet for this connection.
    match timeout(config.close_timeout, &mut writer_task).await {
        Ok(Ok(Err(e))) => debug!("Writer for connection {} failed: {}", connection_id, e),
        Ok(Err(e)) => error!("Writer task for connection {} panicked: {}", connection_id, e),
        Err(_) => {
            debug!("Writer for connection {} did not finish in time", connection_id);
            writer_task.abort();
        }
        Ok(Ok(Ok(()))) => {}
    }

    result
}

/// Reads the upgrade request and answers it.
///
/// Returns the bytes that followed the header block, or `None` if the
/// request was rejected with an HTTP error.
async fn accept_handshake<R, W>(
    reader: &mut R,
    writer: &mut W,
    path: &str,
) -> Result<Option<Vec<u8>>, ConnectionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(1024);

    let parsed = loop {
        match handshake::parse_request(&buf) {
            Ok(Some(parsed)) => break parsed,
            Ok(None) => {}
            Err(e) => {
                reject(writer, 400, "Bad Request").await?;
                return Err(e.into());
            }
        }
        if reader.read_buf(&mut buf).await? == 0 {
            return Err(ConnectionError::ClosedDuringHandshake);
        }
    };
    let (request, used) = parsed;

    if request.path != path {
        info!("Rejecting upgrade for unknown path {}", request.path);
        reject(writer, 404, "Not Found").await?;
        return Ok(None);
    }

    let key = match request.websocket_key() {
        Ok(key) => key,
        Err(e @ (HandshakeError::MissingKey | HandshakeError::Malformed(_))) => {
            warn!("Rejecting upgrade: {}", e);
            reject(writer, 400, "Bad Request").await?;
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    writer
        .write_all(handshake::switching_protocols(key).as_bytes())
        .await?;
    buf.drain(..used);
    Ok(Some(buf))
}

async fn reject<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: u16,
    reason: &str,
) -> Result<(), ConnectionError> {
    writer
        .write_all(handshake::rejection(status, reason).as_bytes())
        .await?;
    writer.shutdown().await?;
    Ok(())
}

async fn read_loop<R>(
    reader: &mut R,
    leftover: Vec<u8>,
    connection_id: ConnectionId,
    config: &ServerConfig,
    engine: &EngineHandle,
    outlet: &ConnectionOutlet,
    closing: &Notify,
) -> Result<(), ConnectionError>
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::with_buffer(leftover, config.max_payload);
    let mut assembler = MessageAssembler::new(config.max_payload);
    let mut chunk = vec![0u8; READ_CHUNK];
    // Set once we have sent a close and are waiting for the peer's echo.
    let mut close_deadline: Option<Instant> = None;

    loop {
        while let Some(frame) = decoder.next_frame()? {
            let Some(message) = assembler.push(frame)? else {
                continue;
            };

            match message {
                Message::Text(bytes) => {
                    if close_deadline.is_none() {
                        handle_text(&bytes, connection_id, engine, outlet)?;
                    }
                }
                Message::Binary(_) => {
                    queue(
                        outlet,
                        &ServerMessage::error(
                            ErrorCode::InvalidMessage,
                            "binary messages are not supported",
                        ),
                    );
                }
                Message::Ping(payload) => {
                    outlet.push(Outbound::Pong(payload));
                }
                Message::Pong(_) => {}
                Message::Unknown(opcode) => {
                    debug!(
                        "Ignoring opcode {:#x} from connection {}",
                        opcode, connection_id
                    );
                }
                Message::Close(code) => {
                    if close_deadline.is_none() {
                        debug!("Connection {} closed by peer ({:?})", connection_id, code);
                        outlet.push(Outbound::CloseEcho);
                    }
                    return Ok(());
                }
            }
        }

        tokio::select! {
            read = reader.read(&mut chunk) => {
                let n = read?;
                if n == 0 {
                    debug!("Connection {} hung up", connection_id);
                    return Ok(());
                }
                decoder.extend(&chunk[..n]);
            },

            _ = outlet.overflowed() => {
                return Err(ConnectionError::Backlogged);
            },

            _ = closing.notified(), if close_deadline.is_none() => {
                close_deadline = Some(Instant::now() + config.close_timeout);
            },

            _ = sleep_until(close_deadline.unwrap_or_else(Instant::now)), if close_deadline.is_some() => {
                debug!("Connection {} never echoed our close", connection_id);
                return Ok(());
            },
        }
    }
}

/// Parses one text message. Unparseable JSON is dropped; JSON that is not a
/// known message gets an error reply.
fn handle_text(
    bytes: &[u8],
    connection_id: ConnectionId,
    engine: &EngineHandle,
    outlet: &ConnectionOutlet,
) -> Result<(), ConnectionError> {
    let value: Value = match serde_json::from_slice(bytes) {
        Ok(value) => value,
        Err(e) => {
            debug!(
                "Discarding unparseable payload from connection {}: {}",
                connection_id, e
            );
            return Ok(());
        }
    };

    let message: ClientMessage = match serde_json::from_value(value) {
        Ok(message) => message,
        Err(e) => {
            queue(
                outlet,
                &ServerMessage::error(ErrorCode::InvalidMessage, e.to_string()),
            );
            return Ok(());
        }
    };

    let message = match message {
        ClientMessage::Ping(probe) => {
            let reply = time_sync::respond(&probe, now_millis());
            queue(outlet, &ServerMessage::Pong(reply));
            return Ok(());
        }
        ClientMessage::Join(request) => SessionMessage::Join(request),
        ClientMessage::Action(request) => SessionMessage::Action(request),
        ClientMessage::AssetsLoaded(loaded) => SessionMessage::AssetsLoaded(loaded),
    };
    if !engine.send(EngineEvent::Message {
        connection_id,
        message,
    }) {
        return Err(ConnectionError::EngineGone);
    }
    Ok(())
}

fn queue(outlet: &ConnectionOutlet, message: &ServerMessage) {
    match serde_json::to_string(message) {
        Ok(text) => {
            outlet.push(Outbound::Text(text.into()));
        }
        Err(e) => error!("Failed to serialize reply: {}", e),
    }
}

/// Writes queued frames until a close is sent or every sender is gone.
async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Outbound>,
    closing: Arc<Notify>,
) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbound.recv().await {
        let frame = match &message {
            Outbound::Text(text) => Frame::text(text.to_string()),
            Outbound::Pong(payload) => Frame::pong(payload.clone()),
            Outbound::Close(code) => Frame::close(Some(*code)),
            Outbound::CloseEcho => Frame::close(None),
        };
        writer.write_all(&encode_frame(&frame, None)).await?;

        match message {
            Outbound::Close(_) => {
                writer.flush().await?;
                closing.notify_one();
                return Ok(());
            }
            Outbound::CloseEcho => break,
            _ => {}
        }
    }

    writer.shutdown().await?;
    Ok(())
}
