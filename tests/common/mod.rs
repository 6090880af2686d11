//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use emu_relay::messaging::InMemoryBroker;
use emu_relay::{RelayConfig, ResilientQueueClient};
use tracing::Level;

/// Route test logs through the test writer; repeated calls are harmless
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Client against `broker` using default relay settings
pub fn client_for(broker: &InMemoryBroker) -> ResilientQueueClient {
    client_with_config(broker, &RelayConfig::default())
}

pub fn client_with_config(broker: &InMemoryBroker, config: &RelayConfig) -> ResilientQueueClient {
    init_test_logging();
    ResilientQueueClient::new(config, Arc::new(broker.clone()))
}

/// Bodies received by a consumer callback
#[derive(Debug, Clone, Default)]
pub struct Received(Arc<Mutex<Vec<String>>>);

impl Received {
    pub fn callback(&self) -> impl FnMut(&str) -> anyhow::Result<()> + Send + 'static {
        let sink = Arc::clone(&self.0);
        move |body: &str| {
            sink.lock().unwrap().push(body.to_string());
            Ok(())
        }
    }

    pub fn bodies(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}
