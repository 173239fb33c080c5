//! Daemon wiring.
//!
//! [`start`] builds the routing service, one relay per configured broker
//! and the client server, and spawns them under one cancellation token.

use std::net::SocketAddr;
use std::sync::Arc;

use duplex_transport::Connector;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::{Clock, EmsHandle, EmsService, RoutingEngine};
use crate::error::EmsError;
use crate::infrastructure::brokerd::{BrokerdRelay, BrokerdRelayConfig};
use crate::infrastructure::client_server::ClientServer;
use crate::infrastructure::config::EmsConfig;

/// A started daemon.
#[derive(Debug)]
pub struct RunningEms {
    local_addr: SocketAddr,
    handle: EmsHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningEms {
    /// Address the client server is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle into the routing service.
    #[must_use]
    pub const fn handle(&self) -> &EmsHandle {
        &self.handle
    }

    /// Wait for every task to finish.
    pub async fn join(self) {
        drop(self.handle);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Daemon task panicked");
            }
        }
    }
}

/// Start the routing service, the broker relays and the client server.
///
/// Everything stops when `cancel` fires.
///
/// # Errors
///
/// Returns [`EmsError::ClientServer`] if the client listener cannot bind.
pub async fn start(
    config: &EmsConfig,
    connector: Arc<dyn Connector>,
    clock: Arc<dyn Clock>,
    cancel: &CancellationToken,
) -> Result<RunningEms, EmsError> {
    let engine = RoutingEngine::new(config.routes(), clock);
    let (mut service, handle) = EmsService::new(engine);
    let mut tasks = Vec::with_capacity(config.brokerds.len() + 2);

    // nothing is spawned until the listener is bound
    let server = ClientServer::bind(config.listen_addr, handle.clone(), cancel.clone()).await?;
    let local_addr = server.local_addr()?;

    for endpoint in &config.brokerds {
        let relay_config = BrokerdRelayConfig {
            broker: endpoint.name.clone(),
            channel: config.channel_config(endpoint),
            rpc: config.rpc,
            client_name: config.client_name.clone(),
            accounts: config.accounts_for(&endpoint.name),
            restart_delay: config.relay_restart,
        };
        let (relay, task) =
            BrokerdRelay::spawn(relay_config, Arc::clone(&connector), handle.clone(), cancel);
        service.register_broker(endpoint.name.clone(), Arc::new(relay));
        tasks.push(task);
        tracing::info!(broker = %endpoint.name, url = %endpoint.url, "Brokerd relay started");
    }

    tasks.push(tokio::spawn(service.run(cancel.clone())));
    tasks.push(tokio::spawn(server.run()));

    Ok(RunningEms {
        local_addr,
        handle,
        tasks,
    })
}
