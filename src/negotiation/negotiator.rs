//! Protocol negotiation.
//!
//! # Responsibilities
//! - Bring up binary RPC, the event-stream fallback, or RPC-then-fallback
//! - Record why a fallback happened
//! - Swap the RPC pool onto another address for failover/failback
//! - Serve as the health monitor's probe target

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::config::schema::{ClientConfig, EndpointConfig, ProtocolMode};
use crate::error::{Result, TransportError};
use crate::health::{AddressSwitcher, HealthProbe};
use crate::load_balancer::ConnectionPool;
use crate::negotiation::protocol::{ActiveTransport, Protocol, ProtocolEvent};
use crate::transport::{Connector, EventStreamTransport};

const EVENT_CAPACITY: usize = 16;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct ProtocolNegotiator {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    active: ArcSwapOption<ActiveTransport>,
    fallback_reason: Mutex<Option<String>>,
    current_address: Mutex<String>,
    events: broadcast::Sender<ProtocolEvent>,
    switching: tokio::sync::Mutex<()>,
}

impl ProtocolNegotiator {
    pub fn new(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let current_address = config.address.clone();
        Self {
            config,
            connector,
            active: ArcSwapOption::empty(),
            fallback_reason: Mutex::new(None),
            current_address: Mutex::new(current_address),
            events,
            switching: tokio::sync::Mutex::new(()),
        }
    }

    /// Bring up a transport according to the configured mode. Calling it
    /// again while connected is a no-op.
    pub async fn connect(&self) -> Result<Protocol> {
        let _guard = self.switching.lock().await;
        if let Some(active) = self.active.load_full() {
            return Ok(active.protocol());
        }

        let transport = match self.config.protocol {
            ProtocolMode::Rpc => self.connect_rpc(self.config.endpoint_list()).await?,
            ProtocolMode::Fallback => self.connect_fallback().await?,
            ProtocolMode::Auto => match self.connect_rpc(self.config.endpoint_list()).await {
                Ok(transport) => transport,
                Err(rpc_error) if self.config.fallback_url.is_some() => {
                    let reason = rpc_error.to_string();
                    tracing::warn!(error = %reason, "Binary RPC unavailable, falling back to event stream");
                    let transport = self.connect_fallback().await.map_err(|e| {
                        TransportError::Connection(format!("rpc: {reason}; fallback: {e}"))
                    })?;
                    *lock(&self.fallback_reason) = Some(reason.clone());
                    metrics::counter!("authz_protocol_fallbacks_total").increment(1);
                    let _ = self.events.send(ProtocolEvent::FellBack { reason });
                    transport
                }
                Err(rpc_error) => return Err(rpc_error),
            },
        };

        let protocol = transport.protocol();
        let address = match &transport {
            ActiveTransport::Rpc(_) => self.current_address(),
            ActiveTransport::EventStream(t) => t.base_url().to_string(),
        };
        self.active.store(Some(Arc::new(transport)));
        tracing::info!(%protocol, %address, "Transport connected");
        let _ = self.events.send(ProtocolEvent::Connected { protocol, address });
        Ok(protocol)
    }

    async fn connect_rpc(&self, endpoints: Vec<EndpointConfig>) -> Result<ActiveTransport> {
        let pool = Arc::new(ConnectionPool::new(
            self.config.connection_pool.clone(),
            endpoints,
            &self.config.reconnect,
            self.config.connect_timeout(),
            Arc::clone(&self.connector),
        ));
        pool.initialize().await?;

        if pool.ready_count() == 0 {
            let reason = pool
                .last_error()
                .unwrap_or_else(|| "no connection became ready".to_string());
            pool.shutdown().await;
            return Err(TransportError::Connection(reason));
        }
        Ok(ActiveTransport::Rpc(pool))
    }

    async fn connect_fallback(&self) -> Result<ActiveTransport> {
        let url = self
            .config
            .fallback_url
            .as_deref()
            .ok_or_else(|| TransportError::Connection("no fallback_url configured".into()))?;
        let transport = EventStreamTransport::new(url, self.config.connect_timeout(), &self.config.reconnect)?;
        transport.connect().await?;
        Ok(ActiveTransport::EventStream(Arc::new(transport)))
    }

    /// Close whatever transport is active.
    pub async fn disconnect(&self) {
        let _guard = self.switching.lock().await;
        if let Some(active) = self.active.swap(None) {
            active.close().await;
            tracing::info!(protocol = %active.protocol(), "Transport disconnected");
            let _ = self.events.send(ProtocolEvent::Disconnected);
        }
    }

    pub fn protocol(&self) -> Option<Protocol> {
        self.active.load_full().map(|a| a.protocol())
    }

    pub fn fallback_reason(&self) -> Option<String> {
        lock(&self.fallback_reason).clone()
    }

    /// The transport serving calls, if connected.
    pub fn active(&self) -> Result<Arc<ActiveTransport>> {
        let active = self.active.load_full().ok_or(TransportError::NotConnected)?;
        active.is_usable()?;
        Ok(active)
    }

    pub fn current_address(&self) -> String {
        lock(&self.current_address).clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.events.subscribe()
    }

    /// Re-target binary RPC at `address`. The new pool must come up before
    /// the old one is shut down.
    pub async fn switch_address(&self, address: &str) -> Result<()> {
        let _guard = self.switching.lock().await;
        match self.active.load_full().as_deref() {
            Some(ActiveTransport::Rpc(_)) => {}
            Some(ActiveTransport::EventStream(_)) => {
                return Err(TransportError::Unsupported("address switching on the event-stream transport"))
            }
            None => return Err(TransportError::NotConnected),
        }

        let endpoints = vec![EndpointConfig {
            address: address.to_string(),
            weight: 1,
        }];
        let transport = self.connect_rpc(endpoints).await?;
        let previous = self.active.swap(Some(Arc::new(transport)));
        *lock(&self.current_address) = address.to_string();

        if let Some(previous) = previous {
            previous.close().await;
        }
        tracing::info!(%address, "Switched RPC address");
        let _ = self.events.send(ProtocolEvent::AddressSwitched {
            address: address.to_string(),
        });
        Ok(())
    }
}

impl fmt::Debug for ProtocolNegotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolNegotiator")
            .field("mode", &self.config.protocol)
            .field("protocol", &self.protocol())
            .field("address", &self.current_address())
            .finish()
    }
}

#[async_trait]
impl HealthProbe for ProtocolNegotiator {
    async fn probe(&self, timeout: Duration) -> Result<()> {
        self.active()?.probe(timeout).await
    }
}

#[async_trait]
impl AddressSwitcher for ProtocolNegotiator {
    async fn switch_address(&self, address: &str) -> Result<()> {
        ProtocolNegotiator::switch_address(self, address).await
    }
}
