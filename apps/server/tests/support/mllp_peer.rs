//! Scripted downstream MLLP system

use conduit_hl7::{build_ack, AckCode, Message};
use conduit_mllp::{Frame, MllpCodec};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

/// How the peer answers one message.
#[derive(Debug, Clone)]
pub enum PeerReply {
    Ack(AckCode),
    /// Answer after a delay
    Delayed(AckCode, Duration),
    /// Read the message and never answer
    Silent,
}

type Script = dyn Fn(&str) -> PeerReply + Send + Sync;

pub struct MllpPeer {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<String>>>,
    task: tokio::task::JoinHandle<()>,
}

impl MllpPeer {
    /// A peer that accepts everything.
    pub async fn accepting() -> anyhow::Result<Self> {
        Self::start(|_| PeerReply::Ack(AckCode::AA)).await
    }

    pub async fn start<F>(script: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> PeerReply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let received = Arc::new(Mutex::new(Vec::new()));
        let script: Arc<Script> = Arc::new(script);

        let log = Arc::clone(&received);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, Arc::clone(&script), Arc::clone(&log)));
            }
        });

        Ok(Self {
            addr,
            received,
            task,
        })
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Every message the peer has read, in arrival order.
    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_count(&self) -> usize {
        self.received.lock().unwrap().len()
    }
}

impl Drop for MllpPeer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(stream: TcpStream, script: Arc<Script>, log: Arc<Mutex<Vec<String>>>) {
    let mut framed = Framed::new(stream, MllpCodec::new());
    while let Some(Ok(frame)) = framed.next().await {
        let Frame::Message(payload) = frame else {
            continue;
        };
        let text = String::from_utf8_lossy(&payload).to_string();
        log.lock().unwrap().push(text.clone());

        let code = match script(&text) {
            PeerReply::Ack(code) => code,
            PeerReply::Delayed(code, delay) => {
                tokio::time::sleep(delay).await;
                code
            }
            PeerReply::Silent => continue,
        };
        let ack = match Message::parse(&text) {
            Ok(message) => build_ack(&message, code, None),
            Err(_) => conduit_hl7::build_bare_ack(code, None),
        };
        if framed.send(ack.as_str()).await.is_err() {
            break;
        }
    }
}
