//! Shared application state.

use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

use crate::config::ServerConfig;
use crate::core::booking::MockFulfillment;
use crate::core::realtime::{BoxedRealtime, RealtimeConfig, RealtimeResult, create_realtime_provider};

/// Builds a realtime provider for a new session.
pub type RealtimeFactory =
    Arc<dyn Fn(RealtimeConfig) -> RealtimeResult<BoxedRealtime> + Send + Sync>;

/// Why a WebSocket connection was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectionLimitError {
    #[error("global WebSocket connection limit reached")]
    GlobalLimitReached,
    #[error("per-IP connection limit reached")]
    PerIpLimitReached,
}

/// State shared by every request handler.
pub struct AppState {
    pub config: ServerConfig,
    pub fulfillment: Arc<MockFulfillment>,
    realtime_factory: RealtimeFactory,
    ws_connections: AtomicUsize,
    ip_connections: DashMap<IpAddr, u32>,
}

impl AppState {
    /// State backed by the OpenAI realtime provider.
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Self::with_realtime_factory(
            config,
            Arc::new(|realtime_config| create_realtime_provider("openai", realtime_config)),
        )
    }

    /// State with a custom provider factory, used to plug in scripted providers.
    pub fn with_realtime_factory(config: ServerConfig, factory: RealtimeFactory) -> Arc<Self> {
        let fulfillment = Arc::new(MockFulfillment::new(config.processing_delay()));
        Arc::new(Self {
            config,
            fulfillment,
            realtime_factory: factory,
            ws_connections: AtomicUsize::new(0),
            ip_connections: DashMap::new(),
        })
    }

    pub fn create_realtime(&self, config: RealtimeConfig) -> RealtimeResult<BoxedRealtime> {
        (self.realtime_factory)(config)
    }

    /// Reserve a WebSocket slot for `ip`, enforcing the global and per-IP limits.
    pub fn try_acquire_connection(&self, ip: IpAddr) -> Result<(), ConnectionLimitError> {
        match self.config.max_websocket_connections {
            Some(max) => {
                self.ws_connections
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        (n < max).then_some(n + 1)
                    })
                    .map_err(|_| ConnectionLimitError::GlobalLimitReached)?;
            }
            None => {
                self.ws_connections.fetch_add(1, Ordering::SeqCst);
            }
        }

        let mut count = self.ip_connections.entry(ip).or_insert(0);
        if *count >= self.config.max_connections_per_ip {
            drop(count);
            self.ws_connections.fetch_sub(1, Ordering::SeqCst);
            return Err(ConnectionLimitError::PerIpLimitReached);
        }
        *count += 1;
        Ok(())
    }

    /// Release a slot taken by [`AppState::try_acquire_connection`].
    pub fn release_connection(&self, ip: IpAddr) {
        if let dashmap::mapref::entry::Entry::Occupied(mut entry) = self.ip_connections.entry(ip) {
            if *entry.get() <= 1 {
                entry.remove();
            } else {
                *entry.get_mut() -= 1;
            }
        }
        let _ = self
            .ws_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn ws_connection_count(&self) -> usize {
        self.ws_connections.load(Ordering::SeqCst)
    }

    pub fn ip_connection_count(&self, ip: &IpAddr) -> u32 {
        self.ip_connections.get(ip).map(|c| *c).unwrap_or(0)
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("address", &self.config.address())
            .field("ws_connections", &self.ws_connection_count())
            .finish()
    }
}
