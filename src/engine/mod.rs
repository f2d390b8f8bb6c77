//! Interfaces to the external engines that do the actual protocol work
//!
//! Two kinds are consumed:
//!
//! - a *tunnel engine* ([`ShadowsocksEngine`]) that turns a raw upstream
//!   stream into an encrypted tunnel towards one destination,
//! - a *full-proxy engine* ([`ProxyEngine`]) that starts from an
//!   [`EngineConfig`] and then dials on its own.
//!
//! Neither is implemented in this crate.

use std::{str::FromStr, sync::Arc};

use async_trait::async_trait;
use tokio::io;

use crate::{
    cache::{InstanceCache, Lookup},
    connect::{BoxedStream, NetworkTarget},
    socks::Destination,
};

pub mod config;

pub use config::EngineConfig;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("No {0} engine was supplied in the client options")]
    NotConfigured(&'static str),

    #[error("Unsupported cipher method `{0}`")]
    UnsupportedMethod(String),

    #[error("Unsupported configuration: {0}")]
    Unsupported(String),

    #[error("Unsupported network `{0}`")]
    UnsupportedNetwork(String),

    #[error("Engine failed to start: {0}")]
    Start(String),

    #[error("Engine instance was closed while starting")]
    ClosedWhileStarting,

    #[error("Input/Output fail")]
    Io(#[from] io::Error),

    #[error("Failed to encode engine config")]
    Config(#[from] serde_json::Error),
}

/// Wraps an already connected upstream stream into a tunnel to `destination`
#[async_trait]
pub trait TunnelDialer: Send + Sync {
    async fn dial_conn(
        &self,
        stream: BoxedStream,
        destination: &Destination,
    ) -> io::Result<BoxedStream>;
}

/// Shadowsocks family cipher factory
pub trait ShadowsocksEngine: Send + Sync {
    fn method(&self, method: &str, password: &str) -> Result<Arc<dyn TunnelDialer>, EngineError>;
}

/// Engine that runs a complete protocol stack from structured config
#[async_trait]
pub trait ProxyEngine: Send + Sync {
    async fn start(&self, config: &EngineConfig) -> Result<Arc<dyn EngineInstance>, EngineError>;
}

/// A started [`ProxyEngine`]
#[async_trait]
pub trait EngineInstance: Send + Sync {
    async fn dial(&self, network: Network, target: &NetworkTarget) -> io::Result<BoxedStream>;

    async fn close(&self) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

impl FromStr for Network {
    type Err = EngineError;

    fn from_str(network: &str) -> Result<Self, Self::Err> {
        match network {
            "tcp" | "tcp4" | "tcp6" => Ok(Network::Tcp),
            "udp" | "udp4" | "udp6" => Ok(Network::Udp),
            other => Err(EngineError::UnsupportedNetwork(other.to_owned())),
        }
    }
}

/// Started engine instances keyed by the proxy URL they serve
#[derive(Default)]
pub struct EngineRegistry {
    instances: InstanceCache<Arc<dyn EngineInstance>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the instance for `url`, starting `engine` with `config` only if
    /// none is cached
    pub async fn get_or_start<F>(
        &self,
        url: &str,
        engine: &dyn ProxyEngine,
        config: F,
    ) -> Result<Arc<dyn EngineInstance>, EngineError>
    where
        F: FnOnce() -> Result<EngineConfig, EngineError>,
    {
        let lookup = self
            .instances
            .get_or_try_init(url, || async {
                let config = config()?;
                let instance = engine.start(&config).await?;
                tracing::info!(url = %url, "engine instance started");
                Ok::<_, EngineError>(instance)
            })
            .await?;
        match lookup {
            Lookup::Ready(instance) => Ok(instance),
            Lookup::Closed { orphan } => {
                if let Some(instance) = orphan {
                    tracing::debug!(url = %url, "closing engine instance started after its close");
                    close_instance(url, instance.as_ref()).await;
                }
                Err(EngineError::ClosedWhileStarting)
            }
        }
    }

    pub async fn get(&self, url: &str) -> Option<Arc<dyn EngineInstance>> {
        self.instances.get(url).await
    }

    /// Closes and forgets the instance for `url`; unknown URLs are a no-op
    pub async fn close(&self, url: &str) -> bool {
        match self.instances.remove_with(url, |_| ()).await {
            Some(instance) => {
                close_instance(url, instance.as_ref()).await;
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        for instance in self.instances.drain().await {
            close_instance("*", instance.as_ref()).await;
        }
    }

    pub async fn len(&self) -> usize {
        self.instances.len().await
    }
}

async fn close_instance(url: &str, instance: &dyn EngineInstance) {
    if let Err(e) = instance.close().await {
        tracing::warn!(url = %url, error = %e, "engine instance close failed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct CountingEngine {
        starts: AtomicUsize,
        closes: Arc<AtomicUsize>,
    }

    struct Instance(Arc<AtomicUsize>);

    #[async_trait]
    impl EngineInstance for Instance {
        async fn dial(&self, _: Network, _: &NetworkTarget) -> io::Result<BoxedStream> {
            Err(io::ErrorKind::Unsupported.into())
        }

        async fn close(&self) -> io::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl ProxyEngine for CountingEngine {
        async fn start(&self, _: &EngineConfig) -> Result<Arc<dyn EngineInstance>, EngineError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Instance(self.closes.clone())))
        }
    }

    #[test]
    fn network_names() {
        assert_eq!("tcp6".parse::<Network>().unwrap(), Network::Tcp);
        assert_eq!("udp".parse::<Network>().unwrap(), Network::Udp);
        assert!("unix".parse::<Network>().is_err());
    }

    #[tokio::test]
    async fn instances_are_cached_per_url() {
        let engine = CountingEngine::default();
        let registry = EngineRegistry::new();

        for _ in 0..3 {
            registry
                .get_or_start("vless://a", &engine, || Ok(EngineConfig::default()))
                .await
                .unwrap();
        }
        registry
            .get_or_start("vless://b", &engine, || Ok(EngineConfig::default()))
            .await
            .unwrap();
        assert_eq!(engine.starts.load(Ordering::SeqCst), 2);

        assert!(registry.close("vless://a").await);
        assert!(!registry.close("vless://a").await);
        assert_eq!(engine.closes.load(Ordering::SeqCst), 1);

        registry.close_all().await;
        assert_eq!(engine.closes.load(Ordering::SeqCst), 2);
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn config_failure_does_not_start() {
        let engine = CountingEngine::default();
        let registry = EngineRegistry::new();
        let result = registry
            .get_or_start("ssr://x", &engine, || {
                Err(EngineError::Unsupported("obfs".to_owned()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(engine.starts.load(Ordering::SeqCst), 0);
    }
}
