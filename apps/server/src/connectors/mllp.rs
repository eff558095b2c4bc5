//! HL7 v2 delivery over pooled MLLP connections

use super::pool::{ConnectionPool, ManageConnection, PoolConfig};
use super::{Connector, ConnectorError, Delivery};
use crate::config::MllpDestinationConfig;
use crate::envelope::MessageEnvelope;
use crate::error::FailureClass;
use async_trait::async_trait;
use conduit_hl7::parse_ack;
use conduit_mllp::{Frame, MllpCodec};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

type MllpConnection = Framed<TcpStream, MllpCodec>;

pub struct MllpConnectionManager {
    address: String,
    connect_timeout: Duration,
    max_frame_length: usize,
}

#[async_trait]
impl ManageConnection for MllpConnectionManager {
    type Connection = MllpConnection;

    async fn connect(&self) -> Result<MllpConnection, ConnectorError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| ConnectorError::Timeout {
                operation: "connect",
                elapsed: self.connect_timeout,
            })??;
        stream.set_nodelay(true)?;
        Ok(Framed::new(
            stream,
            MllpCodec::with_max_frame_length(self.max_frame_length),
        ))
    }

    async fn is_healthy(&self, conn: &mut MllpConnection) -> bool {
        // An idle connection has nothing to read: data or EOF both mean the
        // peer is out of step or gone.
        if !conn.read_buffer().is_empty() {
            return false;
        }
        let mut probe = [0u8; 1];
        match conn.get_ref().try_read(&mut probe) {
            Ok(_) => false,
            Err(e) => e.kind() == std::io::ErrorKind::WouldBlock,
        }
    }
}

/// Sends one frame per envelope and waits for the application ACK on the
/// same connection. AA/CA is delivery; AE/AR/CE/CR is a transient NAK.
pub struct MllpSender {
    destination: String,
    pool: ConnectionPool<MllpConnectionManager>,
    ack_timeout: Duration,
}

impl MllpSender {
    pub fn new(destination: &str, config: &MllpDestinationConfig) -> Self {
        let manager = MllpConnectionManager {
            address: config.address.clone(),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            max_frame_length: config.max_frame_length,
        };
        let pool = ConnectionPool::new(
            destination,
            manager,
            PoolConfig {
                max_size: config.pool_size,
                acquire_timeout: Duration::from_millis(config.acquire_timeout_ms),
                idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            },
        );
        Self {
            destination: destination.to_string(),
            pool,
            ack_timeout: Duration::from_millis(config.ack_timeout_ms),
        }
    }

    pub fn pool(&self) -> &ConnectionPool<MllpConnectionManager> {
        &self.pool
    }
}

async fn next_message(conn: &mut MllpConnection) -> Result<bytes::Bytes, ConnectorError> {
    loop {
        match conn.next().await {
            Some(Ok(Frame::Message(payload))) => return Ok(payload),
            Some(Ok(Frame::KeepAlive)) => continue,
            Some(Ok(Frame::Oversized { buffered })) => {
                return Err(ConnectorError::Protocol(format!(
                    "acknowledgement exceeded frame limit ({} bytes buffered)",
                    buffered
                )))
            }
            Some(Err(e)) => return Err(e.into()),
            None => return Err(ConnectorError::Closed),
        }
    }
}

/// `sent_control_id` is the MSH-10 of the frame just written; an ACK naming
/// another message means the connection is out of step.
fn interpret_ack(payload: &[u8], sent_control_id: Option<&str>) -> Result<Delivery, ConnectorError> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| ConnectorError::Protocol("acknowledgement is not UTF-8".into()))?;
    let ack = parse_ack(text).map_err(|e| ConnectorError::Protocol(e.to_string()))?;
    if let (Some(sent), Some(acked)) = (sent_control_id, ack.acknowledged_control_id.as_deref()) {
        if sent != acked {
            return Err(ConnectorError::Protocol(format!(
                "acknowledgement for '{}' received while awaiting '{}'",
                acked, sent
            )));
        }
    }
    if ack.is_positive() {
        Ok(Delivery::Ack { detail: ack.text })
    } else {
        Ok(Delivery::Nak {
            reason: format!(
                "{}: {}",
                ack.code,
                ack.text.as_deref().unwrap_or("rejected by receiver")
            ),
            class: FailureClass::Transient,
        })
    }
}

#[async_trait]
impl Connector for MllpSender {
    fn destination(&self) -> &str {
        &self.destination
    }

    async fn send(&self, envelope: &MessageEnvelope) -> Result<Delivery, ConnectorError> {
        let payload = envelope.outbound_payload();
        let mut conn = self.pool.get().await?;

        if let Err(e) = conn.send(payload).await {
            conn.discard();
            return Err(e.into());
        }

        let reply = match tokio::time::timeout(self.ack_timeout, next_message(&mut conn)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                conn.discard();
                return Err(e);
            }
            Err(_) => {
                // A late ACK would be read as the reply to the next message.
                conn.discard();
                return Err(ConnectorError::Timeout {
                    operation: "acknowledgement",
                    elapsed: self.ack_timeout,
                });
            }
        };

        let sent_control_id = envelope
            .body()
            .content()
            .as_hl7()
            .and_then(|message| message.control_id());
        let delivery = interpret_ack(&reply, sent_control_id);
        if delivery.is_err() {
            conn.discard();
        }
        tracing::debug!(
            destination = %self.destination,
            message_id = %envelope.message_id(),
            "MLLP exchange complete"
        );
        delivery
    }

    async fn maintain(&self) {
        self.pool.reap_idle().await;
    }

    async fn shutdown(&self) {
        self.pool.close();
    }
}
