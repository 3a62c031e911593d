//! App Builder API
//!
//! Assembles a background context from explicit registration tables:
//! stores, services (with their handlers and jobs), free-standing handlers
//! and jobs. `build` opens the stores, resolves the service graph, binds
//! handlers and jobs, starts the scheduler and attaches the bridge server
//! to the host. The returned `BackgroundHandle` is the single entry point
//! to the running context.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chroma_core::storage::create_storage;
use chroma_core::{
    ChromaConfig, ChromaResult, DispatchError, LocalHost, ResolutionError, SharedClock,
    SharedStorage, Store, StoreRegistry, StoreState, Subscription, SystemClock,
};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::background::{forward_store_changes, install_builtin_handlers, BackgroundServer};
use crate::container::{Container, ServiceBindings, ServiceDescriptor};
use crate::registry::{FnHandler, Handler, HandlerRegistry};
use crate::scheduler::{JobDescriptor, Scheduler};

/// How long `shutdown` waits for the server task
const SERVER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

type StoreOpener = Box<dyn FnOnce(&StoreContext<'_>) -> ChromaResult<()> + Send>;

struct StoreContext<'a> {
    storage: &'a SharedStorage,
    config: &'a ChromaConfig,
    stores: &'a StoreRegistry,
    container: &'a Container,
}

// ----------------------------------------------------------------------------
// App Builder
// ----------------------------------------------------------------------------

/// Builder for a background context
pub struct AppBuilder {
    config: ChromaConfig,
    storage: Option<SharedStorage>,
    clock: Option<SharedClock>,
    stores: Vec<StoreOpener>,
    services: Vec<ServiceDescriptor>,
    handlers: Vec<(String, Arc<dyn Handler>)>,
    jobs: Vec<JobDescriptor>,
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            config: ChromaConfig::default(),
            storage: None,
            clock: None,
            stores: Vec::new(),
            services: Vec::new(),
            handlers: Vec::new(),
            jobs: Vec::new(),
        }
    }

    /// Set the configuration
    pub fn with_config(mut self, config: ChromaConfig) -> Self {
        self.config = config;
        self
    }

    /// Use this storage instead of the configured backend
    pub fn with_storage(mut self, storage: SharedStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Evaluate job schedules against this clock
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Declare a named store
    ///
    /// The store is opened during `build` and provided to services as
    /// `Store<T>`.
    pub fn store<T: StoreState>(mut self, name: impl Into<String>, initial: T) -> Self {
        let name = name.into();
        self.stores.push(Box::new(move |ctx: &StoreContext<'_>| {
            let store = Store::open(
                name,
                initial,
                Some(Arc::clone(ctx.storage)),
                &ctx.config.store,
            );
            ctx.stores.register(Arc::new(store.clone()))?;
            ctx.container.provide(Arc::new(store))?;
            Ok(())
        }));
        self
    }

    /// Declare a service
    pub fn service(mut self, descriptor: impl Into<ServiceDescriptor>) -> Self {
        self.services.push(descriptor.into());
        self
    }

    /// Register a handler that belongs to no service
    pub fn handler(mut self, key: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        self.handlers.push((key.into(), handler));
        self
    }

    /// Register an async closure over raw JSON payloads
    pub fn handler_fn<F, Fut>(self, key: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.handler(key, Arc::new(FnHandler::new(f)))
    }

    /// Register a job that belongs to no service
    pub fn job(mut self, descriptor: JobDescriptor) -> Self {
        self.jobs.push(descriptor);
        self
    }

    /// Build the background context and attach it to `host`
    pub async fn build(self, host: &LocalHost) -> ChromaResult<BackgroundHandle> {
        info!("Building background context");
        self.config.validate()?;

        let storage = self
            .storage
            .unwrap_or_else(|| create_storage(&self.config.storage));
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()));

        // Stores
        let container = Container::new();
        let stores = StoreRegistry::new();
        let ctx = StoreContext {
            storage: &storage,
            config: &self.config,
            stores: &stores,
            container: &container,
        };
        for open in self.stores {
            open(&ctx)?;
        }

        let scheduler = Scheduler::with_clock(clock);
        container.provide(Arc::new(scheduler.clone()))?;
        container.provide(Arc::new(stores.clone()))?;

        // Services
        let mut bindings = Vec::with_capacity(self.services.len());
        for mut descriptor in self.services {
            bindings.push(descriptor.take_bindings());
            container.register(descriptor)?;
        }
        container.resolve_all().await?;

        // Handlers and jobs
        let registry = Arc::new(HandlerRegistry::new());
        install_builtin_handlers(&registry, &stores)?;
        for service in bindings {
            bind_service(&container, &registry, &scheduler, service)?;
        }
        for (key, handler) in self.handlers {
            registry.register(key, handler)?;
        }
        for job in self.jobs {
            scheduler.register(job)?;
        }

        if self.config.scheduler.enabled {
            scheduler.start();
        } else {
            debug!("Scheduler disabled by configuration");
        }

        // Bridge
        let port = host.attach_background();
        let generation = port.generation();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = BackgroundServer::new(port, Arc::clone(&registry), shutdown_rx);
        let server_handle = tokio::spawn(server.run());
        let broadcasts = forward_store_changes(&stores, host);

        info!(
            "Background context started: {} handlers, {} jobs, {} stores",
            registry.len(),
            scheduler.job_names().len(),
            stores.len()
        );

        Ok(BackgroundHandle {
            host: host.clone(),
            generation,
            container,
            registry,
            stores,
            scheduler,
            broadcasts,
            shutdown_tx,
            server_handle: Some(server_handle),
        })
    }
}

fn bind_service(
    container: &Container,
    registry: &HandlerRegistry,
    scheduler: &Scheduler,
    service: ServiceBindings,
) -> ChromaResult<()> {
    let instance =
        container
            .instance(service.type_id)
            .ok_or_else(|| ResolutionError::UnknownService {
                service: service.service.clone(),
            })?;

    for binding in service.handlers {
        let key = binding.key.clone();
        match binding.bind(Arc::clone(&instance)) {
            Some(handler) => registry.register(key, handler)?,
            None => warn!("Handler '{}' does not match service {}", key, service.service),
        }
    }
    for binding in service.jobs {
        let name = binding.name.clone();
        match binding.bind(Arc::clone(&instance)) {
            Some(job) => scheduler.register(job?)?,
            None => warn!("Job '{}' does not match service {}", name, service.service),
        }
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Background Handle
// ----------------------------------------------------------------------------

/// Handle to a running background context
pub struct BackgroundHandle {
    host: LocalHost,
    generation: u64,
    container: Container,
    registry: Arc<HandlerRegistry>,
    stores: StoreRegistry,
    scheduler: Scheduler,
    broadcasts: Vec<Subscription>,
    shutdown_tx: watch::Sender<bool>,
    server_handle: Option<JoinHandle<()>>,
}

impl BackgroundHandle {
    /// Dispatch a request inside the background context, bypassing the bridge
    pub async fn dispatch(&self, key: &str, payload: Value) -> Result<Value, DispatchError> {
        self.registry.dispatch(key, payload).await
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn stores(&self) -> &StoreRegistry {
        &self.stores
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    /// A resolved service, or one resolved now
    pub async fn resolve<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, ResolutionError> {
        self.container.resolve::<T>().await
    }

    /// The store declared with state type `T`
    pub fn store<T: StoreState>(&self) -> Option<Store<T>> {
        self.container
            .get::<Store<T>>()
            .map(|store| (*store).clone())
    }

    /// Attachment generation on the host
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_running(&self) -> bool {
        self.server_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop serving, stop the scheduler and flush every store
    pub async fn shutdown(&mut self) {
        info!("Shutting down background context");
        self.shutdown_tx.send_replace(true);

        if let Some(handle) = self.server_handle.take() {
            let abort = handle.abort_handle();
            if tokio::time::timeout(SERVER_STOP_TIMEOUT, handle).await.is_err() {
                warn!("Background server did not stop in time, aborting");
                abort.abort();
            }
        }

        self.scheduler.shutdown().await;
        for subscription in self.broadcasts.drain(..) {
            subscription.unsubscribe();
        }
        self.stores.shutdown_all().await;
        self.host.detach(self.generation);
        info!("Background context shut down");
    }
}

impl core::fmt::Debug for BackgroundHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BackgroundHandle")
            .field("generation", &self.generation)
            .field("running", &self.is_running())
            .field("registry", &self.registry)
            .field("stores", &self.stores)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
