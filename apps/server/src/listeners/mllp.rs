//! MLLP listener
//!
//! Each accepted connection is a long-lived session with one reader task and
//! one writer task. The reader decodes frames and hands them to the intake;
//! for every frame it first reserves a slot in the connection's bounded
//! pending-ack queue, so the writer emits ACKs in frame order no matter which
//! envelope finishes first. A full queue stops the reader, which leaves the
//! socket unread and pushes back on the sender through TCP.

use crate::config::MllpSourceConfig;
use crate::envelope::MessageStatus;
use crate::metrics;
use crate::pipeline::parse::HL7_V2_CONTENT_TYPE;
use crate::pipeline::{InboundUnit, Intake, IntakeError, ProcessingOutcome};
use bytes::Bytes;
use conduit_hl7::{build_ack, build_bare_ack, AckCode, Message};
use conduit_mllp::{Frame, MllpCodec};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

const ACCEPTED_TEXT: &str = "accepted, processing continues";

/// An acknowledgement owed to the peer, in frame order.
enum PendingAck {
    /// Wait for the pipeline outcome until `deadline`
    Awaiting {
        payload: Bytes,
        reply: oneshot::Receiver<ProcessingOutcome>,
        deadline: Instant,
    },
    /// Already decided (refusals, oversized frames)
    Immediate(String),
}

impl PendingAck {
    async fn resolve(self) -> String {
        match self {
            PendingAck::Immediate(ack) => ack,
            PendingAck::Awaiting {
                payload,
                reply,
                deadline,
            } => match tokio::time::timeout_at(deadline, reply).await {
                Ok(Ok(outcome)) => {
                    let (code, text) = ack_code_for(&outcome);
                    ack_for(&payload, code, text.as_deref())
                }
                Ok(Err(_)) => ack_for(
                    &payload,
                    AckCode::AE,
                    Some("engine stopped before the message completed"),
                ),
                Err(_) => ack_for(&payload, AckCode::AA, Some(ACCEPTED_TEXT)),
            },
        }
    }
}

/// MSA code and text for a finished envelope.
pub fn ack_code_for(outcome: &ProcessingOutcome) -> (AckCode, Option<String>) {
    if outcome.abandoned {
        return (
            AckCode::AE,
            Some("processing interrupted by shutdown".to_string()),
        );
    }
    match outcome.status {
        MessageStatus::Acknowledged => (AckCode::AA, None),
        MessageStatus::Quarantined => (AckCode::AR, outcome.reason.clone()),
        _ => (AckCode::AE, outcome.reason.clone()),
    }
}

/// ACK addressed to the original message when it parses, else a bare one.
fn ack_for(payload: &[u8], code: AckCode, text: Option<&str>) -> String {
    match std::str::from_utf8(payload)
        .ok()
        .and_then(|raw| Message::parse(raw).ok())
    {
        Some(message) => build_ack(&message, code, text),
        None => build_bare_ack(code, text),
    }
}

#[derive(Debug, Clone)]
struct Session {
    route: String,
    peer: SocketAddr,
    max_frame_length: usize,
    max_pending_frames: usize,
    idle_timeout: Duration,
    ack_wait: Duration,
}

pub struct MllpListener {
    route: String,
    config: MllpSourceConfig,
    listener: TcpListener,
    intake: Intake,
}

impl MllpListener {
    pub async fn bind(
        route: &str,
        config: &MllpSourceConfig,
        intake: Intake,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(&config.bind).await?;
        tracing::info!(
            route = %route,
            address = %listener.local_addr()?,
            "MLLP listener bound"
        );
        Ok(Self {
            route: route.to_string(),
            config: config.clone(),
            listener,
            intake,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` fires. Open sessions stop
    /// reading on shutdown and still write the ACKs they owe.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut backoff = Duration::from_millis(10);
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => {
                    backoff = Duration::from_millis(10);
                    pair
                }
                Err(e) => {
                    // Usually fd exhaustion; back off instead of spinning.
                    tracing::warn!(route = %self.route, error = %e, "MLLP accept failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(Duration::from_secs(1));
                    continue;
                }
            };

            let session = Session {
                route: self.route.clone(),
                peer,
                max_frame_length: self.config.max_frame_length,
                max_pending_frames: self.config.max_pending_frames.max(1),
                idle_timeout: Duration::from_secs(self.config.idle_timeout_secs),
                ack_wait: Duration::from_millis(self.config.ack_wait_ms),
            };
            let intake = self.intake.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                metrics::MLLP_SESSIONS.inc();
                serve_connection(stream, session, intake, shutdown).await;
                metrics::MLLP_SESSIONS.dec();
            });
        }
        tracing::info!(route = %self.route, "MLLP listener stopped accepting");
    }
}

async fn serve_connection(
    stream: TcpStream,
    session: Session,
    intake: Intake,
    shutdown: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(peer = %session.peer, error = %e, "Failed to set TCP_NODELAY");
    }
    tracing::info!(route = %session.route, peer = %session.peer, "MLLP session opened");

    let framed = Framed::new(stream, MllpCodec::with_max_frame_length(session.max_frame_length));
    let (mut sink, mut frames) = framed.split();
    let (ack_tx, mut ack_rx) = mpsc::channel::<PendingAck>(session.max_pending_frames);

    let peer = session.peer;
    let writer = tokio::spawn(async move {
        while let Some(pending) = ack_rx.recv().await {
            let ack = pending.resolve().await;
            if let Err(e) = sink.send(ack).await {
                tracing::warn!(peer = %peer, error = %e, "Failed to write ACK, closing session");
                break;
            }
        }
    });

    let source = format!("mllp:{}", session.peer);
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = tokio::time::timeout(session.idle_timeout, frames.next()) => next,
        };
        let frame = match next {
            Err(_) => {
                tracing::info!(peer = %session.peer, "MLLP session idle, closing");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::warn!(peer = %session.peer, error = %e, "MLLP read failed");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        // Slot first: blocks the reader while the queue is full.
        let Ok(slot) = ack_tx.reserve().await else {
            break;
        };

        match frame {
            Frame::KeepAlive => {
                tracing::trace!(peer = %session.peer, "MLLP keep-alive");
            }
            Frame::Oversized { buffered } => {
                tracing::warn!(
                    route = %session.route,
                    peer = %session.peer,
                    buffered,
                    max = session.max_frame_length,
                    "Rejecting oversized MLLP frame"
                );
                metrics::MESSAGES_REFUSED
                    .with_label_values(&[&session.route, "oversized"])
                    .inc();
                slot.send(PendingAck::Immediate(build_bare_ack(
                    AckCode::AR,
                    Some("frame exceeds maximum length"),
                )));
            }
            Frame::Message(payload) => {
                let deadline = Instant::now() + session.ack_wait;
                let (unit, reply) =
                    InboundUnit::new(session.route.clone(), source.clone(), payload.clone())
                        .content_type(Some(HL7_V2_CONTENT_TYPE.to_string()))
                        .annotate("peer", session.peer.to_string())
                        .with_reply();

                match intake.submit(unit).await {
                    Ok(()) => {
                        metrics::MESSAGES_RECEIVED
                            .with_label_values(&[&session.route, "mllp"])
                            .inc();
                        slot.send(PendingAck::Awaiting {
                            payload,
                            reply,
                            deadline,
                        });
                    }
                    Err(e) => {
                        let reason = match e {
                            IntakeError::Busy => "busy",
                            IntakeError::Closed => "closed",
                        };
                        metrics::MESSAGES_REFUSED
                            .with_label_values(&[&session.route, reason])
                            .inc();
                        slot.send(PendingAck::Immediate(ack_for(
                            &payload,
                            AckCode::AE,
                            Some(&e.to_string()),
                        )));
                    }
                }
            }
        }
    }

    drop(ack_tx);
    if let Err(e) = writer.await {
        tracing::warn!(peer = %session.peer, error = %e, "MLLP writer task failed");
    }
    tracing::info!(route = %session.route, peer = %session.peer, "MLLP session closed");
}
