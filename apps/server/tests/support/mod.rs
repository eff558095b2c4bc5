//! Shared fixtures for engine integration tests: configuration loading,
//! a scripted MLLP peer, an MLLP client and an in-process FHIR server.

#![allow(dead_code)]

pub mod fhir_mock;
pub mod mllp_peer;

use anyhow::Context as _;
use bytes::Bytes;
use conduit::Config;
use conduit_mllp::{Frame, MllpCodec};
use futures::{SinkExt, StreamExt};
use std::io::Write as _;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

pub use fhir_mock::{FhirMock, FhirMockBehavior};
pub use mllp_peer::{MllpPeer, PeerReply};

pub const ADT_A01: &str = "MSH|^~\\&|ADT|HOSP|LAB|HOSP|20240101120000||ADT^A01|MSG0001|P|2.5\rPID|1||12345^^^HOSP^MR||DOE^JOHN||19800101|M\r";

/// ADT^A01 with a caller-chosen control id (MSH-10).
pub fn adt_with_control_id(control_id: &str) -> String {
    format!(
        "MSH|^~\\&|ADT|HOSP|LAB|HOSP|20240101120000||ADT^A01|{}|P|2.5\rPID|1||{}^^^HOSP^MR||DOE^JOHN\r",
        control_id, control_id
    )
}

pub fn init_logging() {
    conduit::logging::init_simple_logging();
}

/// Load a TOML configuration through the normal layered loader.
pub fn config_from_toml(toml: &str) -> anyhow::Result<Config> {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .context("create config file")?;
    file.write_all(toml.as_bytes())?;
    let path = file.path().to_str().context("utf-8 config path")?.to_string();
    Config::load_from(Some(&path))
}

/// Client side of an MLLP connection.
pub struct MllpClient {
    framed: Framed<TcpStream, MllpCodec>,
}

impl MllpClient {
    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            framed: Framed::new(stream, MllpCodec::new()),
        })
    }

    pub async fn send(&mut self, payload: &str) -> anyhow::Result<()> {
        self.framed.send(payload.as_bytes()).await?;
        Ok(())
    }

    /// Write raw bytes, bypassing the encoder.
    pub async fn send_raw(&mut self, raw: &[u8]) -> anyhow::Result<()> {
        use tokio::io::AsyncWriteExt;
        self.framed.get_mut().write_all(raw).await?;
        Ok(())
    }

    /// Next acknowledgement frame, skipping keep-alives.
    pub async fn recv_ack(&mut self) -> anyhow::Result<String> {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(10), self.framed.next())
                .await
                .context("timed out waiting for ACK")?
                .context("connection closed")??;
            match frame {
                Frame::Message(payload) => return Ok(String::from_utf8(payload.to_vec())?),
                Frame::KeepAlive => continue,
                Frame::Oversized { .. } => anyhow::bail!("oversized ACK"),
            }
        }
    }

    pub async fn send_keepalive(&mut self) -> anyhow::Result<()> {
        self.framed.send(Bytes::new()).await?;
        Ok(())
    }
}

/// MSA-1 and MSA-2 of an acknowledgement.
pub fn msa(ack: &str) -> (String, String) {
    let parsed = conduit_hl7::parse_ack(ack).expect("valid ACK");
    (
        parsed.code.to_string(),
        parsed.acknowledged_control_id.clone().unwrap_or_default(),
    )
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
