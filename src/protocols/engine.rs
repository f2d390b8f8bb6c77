//! Shared plumbing for schemes served by a full-proxy engine

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    client::{BuildError, ClientOptions, Dialer, Resolver},
    connect::{BoxedStream, ConnectError, NetworkTarget},
    engine::{config::Outbound, EngineConfig, EngineError, EngineInstance, Network},
    parse::ProxyUrl,
    relay::{apply_deadline, dial_with_recover, free_port},
};

/// Dials through a started engine instance
///
/// Connections only carry the `timeout` deadline when `enforce_deadline` is
/// set, which follows the base transport having keep-alives disabled.
pub struct EngineDialer {
    instance: Arc<dyn EngineInstance>,
    timeout: Option<Duration>,
    enforce_deadline: bool,
}

impl EngineDialer {
    pub fn new(
        instance: Arc<dyn EngineInstance>,
        timeout: Option<Duration>,
        enforce_deadline: bool,
    ) -> Self {
        Self {
            instance,
            timeout,
            enforce_deadline,
        }
    }
}

#[async_trait]
impl Dialer for EngineDialer {
    async fn dial(&self, target: &NetworkTarget) -> Result<BoxedStream, ConnectError> {
        let stream = dial_with_recover(self.instance.dial(Network::Tcp, target)).await?;
        apply_deadline(stream, self.timeout, self.enforce_deadline)
    }
}

/// Starts, or reuses, the engine instance serving `url` with the outbound
/// produced by `outbound`
pub(crate) async fn start_dialer<F>(
    backend: &'static str,
    url: &ProxyUrl,
    options: &ClientOptions,
    resolver: &Resolver,
    outbound: F,
) -> Result<Arc<dyn Dialer>, BuildError>
where
    F: FnOnce() -> Result<Outbound, EngineError> + Send,
{
    let engine = options
        .proxy_engine
        .clone()
        .ok_or(EngineError::NotConfigured("proxy"))
        .map_err(BuildError::engine(backend))?;

    let instance = resolver
        .engines()
        .get_or_start(&url.raw, engine.as_ref(), || {
            let outbound = outbound()?;
            Ok(EngineConfig::with_outbound(outbound, free_port()?))
        })
        .await
        .map_err(BuildError::engine(backend))?;

    let enforce_deadline = options.effective_transport().disable_keep_alives;
    Ok(Arc::new(EngineDialer::new(
        instance,
        options.timeout,
        enforce_deadline,
    )))
}
