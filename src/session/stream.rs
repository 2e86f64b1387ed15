//! Bidirectional packet relay
//!
//! Each session runs two pumps: upstream (client to broker) and downstream
//! (broker to client). Each pump owns one read half and the opposite write
//! half. The first pump to stop ends the session; the other pump is told to
//! stop at its next read so both write halves come back to the relay.

use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use super::{Direction, Handler, Interceptor, Publication, Session};
use crate::certificate::PeerCertificate;
use crate::mqtt::{read_packet, write_packet, CodecError, ControlPacket, MqttPacket};

/// Why a single pump stopped
#[derive(Debug, thiserror::Error)]
pub enum PumpError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("unauthorized: {0:#}")]
    Unauthorized(anyhow::Error),

    #[error("delivery to client not authorized: {0:#}")]
    DeliveryDenied(anyhow::Error),

    #[error("packet rejected by interceptor: {0:#}")]
    Intercepted(anyhow::Error),

    #[error("failed to write packet: {0}")]
    Write(CodecError),

    #[error("notification hook failed: {0:#}")]
    Notify(anyhow::Error),
}

/// Terminal error of a relay session
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("failed to proxy from MQTT client with id {client_id} to MQTT broker with error: {error}")]
    Upstream { client_id: String, error: PumpError },

    #[error("failed to proxy from MQTT broker to client with id {client_id} with error: {error}")]
    Downstream { client_id: String, error: PumpError },

    #[error("failed to send DISCONNECT to MQTT broker: {0}")]
    BrokerDisconnect(CodecError),

    #[error("disconnect hook failed: {0:#}")]
    Disconnect(anyhow::Error),

    #[error("relay task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("{}", join_messages(.0))]
    Joined(Vec<RelayError>),
}

impl RelayError {
    fn from_pump(direction: Direction, client_id: &str, error: PumpError) -> Self {
        let client_id = client_id.to_string();
        match direction {
            Direction::Upstream => Self::Upstream { client_id, error },
            Direction::Downstream => Self::Downstream { client_id, error },
        }
    }

    fn join(mut errors: Vec<RelayError>) -> Option<RelayError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Joined(errors)),
        }
    }

    /// The pump error behind this error, if any
    pub fn pump_error(&self) -> Option<&PumpError> {
        match self {
            Self::Upstream { error, .. } | Self::Downstream { error, .. } => Some(error),
            Self::Joined(errors) => errors.iter().find_map(RelayError::pump_error),
            _ => None,
        }
    }
}

fn join_messages(errors: &[RelayError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Relays MQTT sessions through a policy [`Handler`]
#[derive(Clone)]
pub struct Relay {
    handler: Arc<dyn Handler>,
    interceptor: Option<Arc<dyn Interceptor>>,
    log_packets: bool,
}

impl Relay {
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        Self {
            handler,
            interceptor: None,
            log_packets: false,
        }
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    /// Log every forwarded packet at debug level
    pub fn with_packet_logging(mut self, enabled: bool) -> Self {
        self.log_packets = enabled;
        self
    }

    /// Relay one session until either side closes or a pump fails.
    ///
    /// A clean end of stream on either side returns `Ok(())`. The handler's
    /// `disconnect` hook is called exactly once before returning and its
    /// error, if any, is joined with the session error.
    pub async fn stream<C, B>(&self, client: C, broker: B, session: Session) -> Result<(), RelayError>
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
        B: AsyncRead + AsyncWrite + Send + 'static,
    {
        let session = Arc::new(RwLock::new(session));
        let (client_reader, client_writer) = tokio::io::split(client);
        let (broker_reader, broker_writer) = tokio::io::split(broker);
        let (exit_tx, mut exit_rx) = mpsc::channel(2);
        let (stop_tx, stop_rx) = watch::channel(false);

        let upstream = tokio::spawn(self.pump(Direction::Upstream, &session, stop_rx.clone()).run(
            client_reader,
            broker_writer,
            exit_tx.clone(),
        ));
        let downstream = tokio::spawn(self.pump(Direction::Downstream, &session, stop_rx).run(
            broker_reader,
            client_writer,
            exit_tx,
        ));

        let mut exits = Vec::with_capacity(2);
        if let Some(exit) = exit_rx.recv().await {
            exits.push(exit);
        }
        let _ = stop_tx.send(true);

        let mut errors = Vec::new();
        let broker_writer = upstream.await.map_err(|e| errors.push(RelayError::Task(e))).ok();
        let client_writer = downstream.await.map_err(|e| errors.push(RelayError::Task(e))).ok();
        while let Some(exit) = exit_rx.recv().await {
            exits.push(exit);
        }

        let snapshot = session.read().clone();
        let mut disconnect_broker = false;
        let mut terminal = None;
        for (direction, result) in exits {
            let Err(error) = result else { continue };
            if terminal.is_some() {
                debug!(
                    client_id = %snapshot.client_id(),
                    %direction,
                    error = %error,
                    "Additional pump error after session end"
                );
                continue;
            }
            disconnect_broker = matches!(error, PumpError::DeliveryDenied(_));
            terminal = Some(RelayError::from_pump(direction, snapshot.client_id(), error));
        }
        if let Some(error) = terminal {
            errors.insert(0, error);
        }

        if let Some(mut writer) = broker_writer {
            if disconnect_broker {
                info!(client_id = %snapshot.client_id(), "Disconnecting from broker after denied delivery");
                if let Err(e) = write_packet(&mut writer, &ControlPacket::disconnect()).await {
                    errors.push(RelayError::BrokerDisconnect(e));
                }
            }
            let _ = writer.shutdown().await;
        }
        if let Some(mut writer) = client_writer {
            let _ = writer.shutdown().await;
        }

        if let Err(e) = self.handler.disconnect(&snapshot).await {
            errors.push(RelayError::Disconnect(e));
        }

        match RelayError::join(errors) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn pump(&self, direction: Direction, session: &Arc<RwLock<Session>>, stop: watch::Receiver<bool>) -> Pump {
        Pump {
            direction,
            handler: Arc::clone(&self.handler),
            interceptor: self.interceptor.clone(),
            session: Arc::clone(session),
            stop,
            log_packets: self.log_packets,
            connected: false,
        }
    }
}

/// Relay one session with a fresh [`Session`] carrying `certificate`
pub async fn stream<C, B>(
    client: C,
    broker: B,
    handler: Arc<dyn Handler>,
    interceptor: Option<Arc<dyn Interceptor>>,
    certificate: Option<Arc<PeerCertificate>>,
) -> Result<(), RelayError>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut relay = Relay::new(handler);
    if let Some(interceptor) = interceptor {
        relay = relay.with_interceptor(interceptor);
    }
    relay.stream(client, broker, Session::new(certificate)).await
}

type PumpExit = (Direction, Result<(), PumpError>);

struct Pump {
    direction: Direction,
    handler: Arc<dyn Handler>,
    interceptor: Option<Arc<dyn Interceptor>>,
    session: Arc<RwLock<Session>>,
    stop: watch::Receiver<bool>,
    log_packets: bool,
    /// Set once the client's CONNECT has been authorized
    connected: bool,
}

impl Pump {
    async fn run<R, W>(mut self, mut reader: R, mut writer: W, exits: mpsc::Sender<PumpExit>) -> W
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let result = self.forward(&mut reader, &mut writer).await;
        if let Err(e) = &result {
            warn!(
                client_id = %self.snapshot().client_id(),
                direction = %self.direction,
                error = %e,
                "Relay pump stopped"
            );
        }
        let _ = exits.send((self.direction, result)).await;
        writer
    }

    async fn forward<R, W>(&mut self, reader: &mut R, writer: &mut W) -> Result<(), PumpError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.stop.changed() => return Ok(()),
                next = read_packet(reader) => next?,
            };
            let Some(packet) = next else {
                trace!(direction = %self.direction, "End of stream");
                return Ok(());
            };

            let packet = match self.direction {
                Direction::Upstream => self.authorize_upstream(packet).await?,
                Direction::Downstream => self.authorize_downstream(packet).await?,
            };

            let packet = match &self.interceptor {
                Some(interceptor) => interceptor
                    .intercept(&self.snapshot(), packet, self.direction)
                    .await
                    .map_err(PumpError::Intercepted)?,
                None => packet,
            };

            if self.log_packets {
                debug!(
                    client_id = %self.snapshot().client_id(),
                    direction = %self.direction,
                    packet_type = %packet.packet_type(),
                    rewritten = !packet.is_original(),
                    "Forwarding packet"
                );
            }
            write_packet(writer, &packet).await.map_err(PumpError::Write)?;

            if self.direction == Direction::Upstream {
                self.notify(&packet).await?;
            }
        }
    }

    async fn authorize_upstream(&mut self, mut packet: ControlPacket) -> Result<ControlPacket, PumpError> {
        match packet.packet() {
            // A client may send CONNECT only once per network connection
            MqttPacket::Connect(_) if self.connected => {
                return Err(PumpError::Unauthorized(anyhow!(
                    "second CONNECT packet on an established session"
                )));
            }

            MqttPacket::Connect(connect) => {
                let requested = self.snapshot().with_connect(connect);
                let authorized = self
                    .handler
                    .auth_connect(requested.clone())
                    .await
                    .map_err(PumpError::Unauthorized)?;

                if !authorized.same_identity(&requested) {
                    if let MqttPacket::Connect(connect) = packet.packet_mut() {
                        authorized.write_connect(connect);
                    }
                }
                *self.session.write() = authorized;
                self.connected = true;
            }

            MqttPacket::Publish(publish) => {
                let requested = Publication::from(publish);
                let authorized = self
                    .handler
                    .auth_publish(&self.snapshot(), requested.clone())
                    .await
                    .map_err(PumpError::Unauthorized)?;

                if authorized != requested {
                    if let MqttPacket::Publish(publish) = packet.packet_mut() {
                        publish.topic = authorized.topic;
                        publish.payload = authorized.payload;
                    }
                }
            }

            MqttPacket::Subscribe(subscribe) => {
                let requested = subscribe.topic_filters();
                let authorized = self
                    .handler
                    .auth_subscribe(&self.snapshot(), requested.clone())
                    .await
                    .map_err(PumpError::Unauthorized)?;

                if authorized.is_empty() {
                    return Err(PumpError::Unauthorized(anyhow!(
                        "no topics left to subscribe to"
                    )));
                }
                if authorized != requested {
                    if let MqttPacket::Subscribe(subscribe) = packet.packet_mut() {
                        subscribe.replace_topic_filters(authorized);
                    }
                }
            }

            _ => {}
        }

        Ok(packet)
    }

    async fn authorize_downstream(&self, packet: ControlPacket) -> Result<ControlPacket, PumpError> {
        if let MqttPacket::Publish(publish) = packet.packet() {
            self.handler
                .auth_subscribe(&self.snapshot(), vec![publish.topic.clone()])
                .await
                .map_err(PumpError::DeliveryDenied)?;
        }
        Ok(packet)
    }

    async fn notify(&self, packet: &ControlPacket) -> Result<(), PumpError> {
        let session = self.snapshot();
        let result = match packet.packet() {
            MqttPacket::Connect(_) => self.handler.connect(&session).await,
            MqttPacket::Publish(publish) => {
                self.handler
                    .publish(&session, &Publication::from(publish))
                    .await
            }
            MqttPacket::Subscribe(subscribe) => {
                self.handler
                    .subscribe(&session, &subscribe.topic_filters())
                    .await
            }
            MqttPacket::Unsubscribe(unsubscribe) => {
                self.handler.unsubscribe(&session, &unsubscribe.topics).await
            }
            _ => Ok(()),
        };
        result.map_err(PumpError::Notify)
    }

    fn snapshot(&self) -> Session {
        self.session.read().clone()
    }
}
