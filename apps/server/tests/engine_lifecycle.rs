//! Engine start-up failure releases what was already set up

mod support;

use async_trait::async_trait;
use conduit::envelope::MessageEnvelope;
use conduit::error::StageError;
use conduit::plugins::{
    Annotations, Plugin, PluginError, PluginRegistryBuilder, PluginSettings, StageContext,
    Validator,
};
use conduit::{Engine, EngineOptions, Error};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Tracked {
    shutdowns: Arc<AtomicUsize>,
}

#[async_trait]
impl Plugin for Tracked {
    fn name(&self) -> &str {
        "tracked"
    }

    async fn shutdown(&self) -> Result<(), PluginError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Validator for Tracked {
    async fn validate(
        &self,
        _envelope: &MessageEnvelope,
        _ctx: &StageContext<'_>,
    ) -> Result<Annotations, StageError> {
        Ok(Annotations::new())
    }
}

#[tokio::test]
async fn failed_bind_shuts_down_initialized_plugins() -> anyhow::Result<()> {
    support::init_logging();
    // Hold the port so the MLLP listener cannot bind it.
    let occupied = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let address = occupied.local_addr()?;

    let toml = format!(
        r#"
[server]
host = "127.0.0.1"
port = 0
cors_origins = []

[[destinations]]
id = "lab"
transport = "mllp"
address = "127.0.0.1:9"

[[routes]]
name = "adt"
destinations = ["lab"]

[routes.source]
transport = "mllp"
bind = "{}"
"#,
        address
    );
    let config = support::config_from_toml(&toml)?;

    let shutdowns = Arc::new(AtomicUsize::new(0));
    let options = EngineOptions {
        plugins: PluginRegistryBuilder::new().validator(
            Tracked {
                shutdowns: Arc::clone(&shutdowns),
            },
            PluginSettings::new(),
        )?,
        ..Default::default()
    };

    match Engine::start_with(config, options).await {
        Err(Error::Config(reason)) => assert!(reason.contains("cannot bind"), "{}", reason),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("engine started on an occupied port"),
    }
    assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    Ok(())
}
