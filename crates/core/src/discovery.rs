//! Client selection driven by a discovery service.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache_refresh::{fuzzy, sleep_or_cancel};
use crate::crypto::Encoder;
use crate::remote::{
    ApiClient, ClientProvider, CoreClient, DiscoveryClient, EndpointKind, HttpApiClient,
    HttpCoreClient, HttpCredentials, HttpDiscoveryClient, MetadataCrateReader, ServiceEndpoint,
    ServiceDiscoveryResult, StaticClientProvider,
};
use crate::secrets::{DerivationConfig, DeviceSecret};
use crate::{Error, Result};

/// Builds clients for discovered endpoints.
pub trait ClientFactory: Send + Sync {
    fn core(&self, endpoint: &ServiceEndpoint) -> Arc<dyn CoreClient>;

    fn api(&self, endpoint: &ServiceEndpoint, core: Arc<dyn CoreClient>) -> Arc<dyn ApiClient>;

    fn discovery(&self, endpoint: &ServiceEndpoint) -> Arc<dyn DiscoveryClient>;
}

pub struct HttpClientFactory {
    credentials: Option<HttpCredentials>,
    secret: Arc<DeviceSecret>,
    derivation: DerivationConfig,
    encoder: Arc<dyn Encoder>,
}

impl HttpClientFactory {
    pub fn new(
        credentials: Option<HttpCredentials>,
        secret: Arc<DeviceSecret>,
        derivation: DerivationConfig,
        encoder: Arc<dyn Encoder>,
    ) -> Self {
        Self {
            credentials,
            secret,
            derivation,
            encoder,
        }
    }
}

impl ClientFactory for HttpClientFactory {
    fn core(&self, endpoint: &ServiceEndpoint) -> Arc<dyn CoreClient> {
        Arc::new(HttpCoreClient::new(
            endpoint.id.clone(),
            endpoint.url.clone(),
            self.credentials.clone(),
        ))
    }

    fn api(&self, endpoint: &ServiceEndpoint, core: Arc<dyn CoreClient>) -> Arc<dyn ApiClient> {
        let reader = MetadataCrateReader::new(
            core,
            Arc::clone(&self.secret),
            self.derivation.clone(),
            Arc::clone(&self.encoder),
        );
        Arc::new(HttpApiClient::new(
            endpoint.id.clone(),
            endpoint.url.clone(),
            self.credentials.clone(),
            reader,
        ))
    }

    fn discovery(&self, endpoint: &ServiceEndpoint) -> Arc<dyn DiscoveryClient> {
        Arc::new(HttpDiscoveryClient::new(
            endpoint.id.clone(),
            endpoint.url.clone(),
            self.credentials.clone(),
        ))
    }
}

/// Api clients read metadata crates through a core client, so each one is
/// kept with the id of the core client it was built on.
#[derive(Default)]
struct Clients {
    core: BTreeMap<String, Arc<dyn CoreClient>>,
    api: BTreeMap<String, (String, Arc<dyn ApiClient>)>,
    discovery: BTreeMap<String, Arc<dyn DiscoveryClient>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryTiming {
    pub initial_delay: Duration,
    pub interval: Duration,
}

impl DiscoveryTiming {
    /// Delay before the next request; a failure halves the previous delay but
    /// never goes below the initial delay.
    pub fn next_delay(&self, previous: Duration, succeeded: bool) -> Duration {
        if succeeded {
            self.interval
        } else {
            (previous / 2).max(self.initial_delay)
        }
    }
}

pub struct DefaultServiceDiscovery {
    factory: Arc<dyn ClientFactory>,
    timing: DiscoveryTiming,
    clients: RwLock<Clients>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl DefaultServiceDiscovery {
    /// `endpoints` seeds the client set, typically with the configured
    /// discovery, api and core endpoints.
    pub fn new(
        factory: Arc<dyn ClientFactory>,
        endpoints: Vec<ServiceEndpoint>,
        timing: DiscoveryTiming,
    ) -> Self {
        let discovery = Self {
            factory,
            timing,
            clients: RwLock::new(Clients::default()),
            task: Mutex::new(None),
        };
        discovery.switch_to(&endpoints, true);
        discovery
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Clients> {
        self.clients.read().unwrap_or_else(|e| e.into_inner())
    }

    fn task(&self) -> MutexGuard<'_, Option<(CancellationToken, JoinHandle<()>)>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn apply(&self, result: &ServiceDiscoveryResult) {
        match result {
            ServiceDiscoveryResult::KeepExisting => {
                debug!(event = "discovery.keep_existing", "discovery.keep_existing");
            }
            ServiceDiscoveryResult::SwitchTo {
                endpoints,
                recreate_existing,
            } => self.switch_to(endpoints, *recreate_existing),
        }
    }

    fn switch_to(&self, endpoints: &[ServiceEndpoint], recreate_existing: bool) {
        let of_kind = |kind: EndpointKind| -> BTreeMap<&str, &ServiceEndpoint> {
            endpoints
                .iter()
                .filter(|e| e.kind == kind)
                .map(|e| (e.id.as_str(), e))
                .collect()
        };
        let core_endpoints = of_kind(EndpointKind::Core);
        let api_endpoints = of_kind(EndpointKind::Api);
        let discovery_endpoints = of_kind(EndpointKind::Discovery);

        let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
        if recreate_existing {
            *clients = Clients::default();
        }

        clients
            .core
            .retain(|id, _| core_endpoints.contains_key(id.as_str()));
        for (id, endpoint) in &core_endpoints {
            if !clients.core.contains_key(*id) {
                clients
                    .core
                    .insert(id.to_string(), self.factory.core(endpoint));
            }
        }

        let Clients { core, api, .. } = &mut *clients;
        api.retain(|id, (bound, _)| {
            let keep =
                api_endpoints.contains_key(id.as_str()) && core.contains_key(bound.as_str());
            if !keep {
                debug!(
                    event = "discovery.api_dropped",
                    api = %id,
                    core = %bound,
                    "discovery.api_dropped"
                );
            }
            keep
        });
        if let Some((core_id, core)) = core.iter().next() {
            for (id, endpoint) in &api_endpoints {
                if !api.contains_key(*id) {
                    let client = self.factory.api(endpoint, Arc::clone(core));
                    api.insert(id.to_string(), (core_id.clone(), client));
                }
            }
        }

        clients
            .discovery
            .retain(|id, _| discovery_endpoints.contains_key(id.as_str()));
        for (id, endpoint) in &discovery_endpoints {
            if !clients.discovery.contains_key(*id) {
                clients
                    .discovery
                    .insert(id.to_string(), self.factory.discovery(endpoint));
            }
        }

        info!(
            event = "discovery.clients_updated",
            recreate_existing,
            core = clients.core.len(),
            api = clients.api.len(),
            discovery = clients.discovery.len(),
            "discovery.clients_updated"
        );
    }

    pub async fn discover_once(&self, is_initial_request: bool) -> Result<()> {
        let client = self
            .read()
            .discovery
            .values()
            .next()
            .cloned()
            .ok_or_else(|| Error::remote("no discovery client available"))?;
        let result = client.latest(is_initial_request).await?;
        self.apply(&result);
        Ok(())
    }

    pub fn start(self: &Arc<Self>) {
        let mut task = self.task();
        if task.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let discovery = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let timing = discovery.timing;
            if !sleep_or_cancel(timing.initial_delay, &loop_cancel).await {
                return;
            }

            let mut is_initial = true;
            let mut delay = timing.interval;
            loop {
                let succeeded = match discovery.discover_once(is_initial).await {
                    Ok(()) => {
                        is_initial = false;
                        true
                    }
                    Err(e) => {
                        warn!(
                            event = "discovery.failed",
                            error = %e,
                            "discovery.failed"
                        );
                        false
                    }
                };
                delay = timing.next_delay(delay, succeeded);
                if !sleep_or_cancel(fuzzy(delay), &loop_cancel).await {
                    return;
                }
            }
        });
        *task = Some((cancel, handle));
    }

    pub async fn stop(&self) {
        let running = self.task().take();
        if let Some((cancel, handle)) = running {
            cancel.cancel();
            let _ = handle.await;
        }
    }
}

impl ClientProvider for DefaultServiceDiscovery {
    fn api(&self) -> Result<Arc<dyn ApiClient>> {
        self.read()
            .api
            .values()
            .next()
            .map(|(_, api)| Arc::clone(api))
            .ok_or_else(|| Error::remote("no api client available"))
    }

    fn core(&self) -> Result<Arc<dyn CoreClient>> {
        self.read()
            .core
            .values()
            .next()
            .cloned()
            .ok_or_else(|| Error::remote("no core client available"))
    }
}

/// Either fixed clients or clients kept current by a discovery service.
#[derive(Clone)]
pub enum ServiceDiscoveryProvider {
    Disabled(StaticClientProvider),
    Default(Arc<DefaultServiceDiscovery>),
}

impl ServiceDiscoveryProvider {
    pub fn start(&self) {
        if let Self::Default(discovery) = self {
            discovery.start();
        }
    }

    pub async fn stop(&self) {
        if let Self::Default(discovery) = self {
            discovery.stop().await;
        }
    }
}

impl ClientProvider for ServiceDiscoveryProvider {
    fn api(&self) -> Result<Arc<dyn ApiClient>> {
        match self {
            Self::Disabled(clients) => clients.api(),
            Self::Default(discovery) => discovery.api(),
        }
    }

    fn core(&self) -> Result<Arc<dyn CoreClient>> {
        match self {
            Self::Disabled(clients) => clients.core(),
            Self::Default(discovery) => discovery.core(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::crypto::XChaChaEncoder;
    use crate::model::{CrateId, Manifest};
    use crate::remote::{BoxFuture, InMemoryApiClient, InMemoryCoreClient};

    #[derive(Default)]
    struct CountingFactory {
        created: AtomicUsize,
        /// `(api endpoint, core client)` for every api client built.
        bindings: Mutex<Vec<(String, String)>>,
    }

    struct NamedCore(String, InMemoryCoreClient);

    impl CoreClient for NamedCore {
        fn id(&self) -> &str {
            &self.0
        }

        fn push<'a>(&'a self, manifest: Manifest, content: Vec<u8>) -> BoxFuture<'a, ()> {
            self.1.push(manifest, content)
        }

        fn pull<'a>(&'a self, crate_id: CrateId) -> BoxFuture<'a, Option<Vec<u8>>> {
            self.1.pull(crate_id)
        }
    }

    struct NamedDiscovery(String);

    impl DiscoveryClient for NamedDiscovery {
        fn id(&self) -> &str {
            &self.0
        }

        fn latest<'a>(&'a self, _: bool) -> BoxFuture<'a, ServiceDiscoveryResult> {
            Box::pin(async { Ok(ServiceDiscoveryResult::KeepExisting) })
        }
    }

    impl ClientFactory for CountingFactory {
        fn core(&self, endpoint: &ServiceEndpoint) -> Arc<dyn CoreClient> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Arc::new(NamedCore(endpoint.id.clone(), InMemoryCoreClient::new()))
        }

        fn api(&self, endpoint: &ServiceEndpoint, core: Arc<dyn CoreClient>) -> Arc<dyn ApiClient> {
            self.created.fetch_add(1, Ordering::SeqCst);
            self.bindings
                .lock()
                .unwrap()
                .push((endpoint.id.clone(), core.id().to_string()));
            let secret = Arc::new(DeviceSecret::generate(uuid::Uuid::new_v4(), uuid::Uuid::new_v4()));
            Arc::new(InMemoryApiClient::new(MetadataCrateReader::new(
                core,
                secret,
                DerivationConfig::default(),
                Arc::new(XChaChaEncoder),
            )))
        }

        fn discovery(&self, endpoint: &ServiceEndpoint) -> Arc<dyn DiscoveryClient> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Arc::new(NamedDiscovery(endpoint.id.clone()))
        }
    }

    fn endpoint(id: &str, kind: EndpointKind) -> ServiceEndpoint {
        ServiceEndpoint {
            id: id.to_string(),
            kind,
            url: format!("http://{id}"),
        }
    }

    fn timing() -> DiscoveryTiming {
        DiscoveryTiming {
            initial_delay: Duration::from_secs(5),
            interval: Duration::from_secs(60),
        }
    }

    #[test]
    fn incremental_switch_only_creates_new_clients() {
        let factory = Arc::new(CountingFactory::default());
        let discovery = DefaultServiceDiscovery::new(
            factory.clone(),
            vec![
                endpoint("core-a", EndpointKind::Core),
                endpoint("api-a", EndpointKind::Api),
                endpoint("disc-a", EndpointKind::Discovery),
            ],
            timing(),
        );
        assert_eq!(factory.created.load(Ordering::SeqCst), 3);
        assert!(discovery.api().is_ok());

        discovery.apply(&ServiceDiscoveryResult::SwitchTo {
            endpoints: vec![
                endpoint("core-a", EndpointKind::Core),
                endpoint("core-b", EndpointKind::Core),
                endpoint("disc-a", EndpointKind::Discovery),
            ],
            recreate_existing: false,
        });
        assert_eq!(factory.created.load(Ordering::SeqCst), 4);
        assert!(discovery.api().is_err());
        assert_eq!(discovery.read().core.len(), 2);

        discovery.apply(&ServiceDiscoveryResult::SwitchTo {
            endpoints: vec![
                endpoint("core-b", EndpointKind::Core),
                endpoint("disc-a", EndpointKind::Discovery),
            ],
            recreate_existing: true,
        });
        assert_eq!(factory.created.load(Ordering::SeqCst), 6);
        assert_eq!(discovery.core().unwrap().id(), "core-b");
    }

    fn bound_core(discovery: &DefaultServiceDiscovery, api: &str) -> Option<String> {
        discovery.read().api.get(api).map(|(core, _)| core.clone())
    }

    #[test]
    fn api_clients_follow_their_core_client_out() {
        let factory = Arc::new(CountingFactory::default());
        let discovery = DefaultServiceDiscovery::new(
            factory.clone(),
            vec![
                endpoint("core-a", EndpointKind::Core),
                endpoint("api-a", EndpointKind::Api),
            ],
            timing(),
        );
        assert_eq!(bound_core(&discovery, "api-a").as_deref(), Some("core-a"));

        discovery.apply(&ServiceDiscoveryResult::SwitchTo {
            endpoints: vec![
                endpoint("core-b", EndpointKind::Core),
                endpoint("api-a", EndpointKind::Api),
            ],
            recreate_existing: false,
        });
        assert_eq!(discovery.core().unwrap().id(), "core-b");
        assert_eq!(bound_core(&discovery, "api-a").as_deref(), Some("core-b"));
        assert_eq!(
            *factory.bindings.lock().unwrap(),
            vec![
                ("api-a".to_string(), "core-a".to_string()),
                ("api-a".to_string(), "core-b".to_string()),
            ]
        );

        // Adding a core client leaves a still-valid binding alone.
        discovery.apply(&ServiceDiscoveryResult::SwitchTo {
            endpoints: vec![
                endpoint("core-a", EndpointKind::Core),
                endpoint("core-b", EndpointKind::Core),
                endpoint("api-a", EndpointKind::Api),
            ],
            recreate_existing: false,
        });
        assert_eq!(bound_core(&discovery, "api-a").as_deref(), Some("core-b"));
        assert_eq!(factory.bindings.lock().unwrap().len(), 2);
    }

    #[test]
    fn keep_existing_changes_nothing() {
        let factory = Arc::new(CountingFactory::default());
        let discovery = DefaultServiceDiscovery::new(
            factory.clone(),
            vec![endpoint("core-a", EndpointKind::Core)],
            timing(),
        );
        discovery.apply(&ServiceDiscoveryResult::KeepExisting);
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert!(discovery.core().is_ok());
    }

    #[test]
    fn failures_halve_the_delay_down_to_the_initial_delay() {
        let t = timing();
        let d1 = t.next_delay(t.interval, false);
        assert_eq!(d1, Duration::from_secs(30));
        let d2 = t.next_delay(d1, false);
        assert_eq!(d2, Duration::from_secs(15));
        let d3 = t.next_delay(Duration::from_secs(8), false);
        assert_eq!(d3, Duration::from_secs(5));
        assert_eq!(t.next_delay(d3, true), t.interval);
    }

    #[tokio::test]
    async fn discover_once_without_discovery_client_fails() {
        let discovery = DefaultServiceDiscovery::new(
            Arc::new(CountingFactory::default()),
            vec![endpoint("core-a", EndpointKind::Core)],
            timing(),
        );
        assert!(discovery.discover_once(true).await.is_err());
    }
}
