//! Service Container
//!
//! Services are registered as `ServiceDescriptor`s: a factory plus the list
//! of services it imports (constructed before it, handed to the factory) and
//! the list it merely uses (resolved lazily on first access). Each service
//! type is instantiated at most once per container.
//!
//! Resolution first plans a topological order over the import graph, so a
//! cycle or an unknown service is reported before anything is constructed.
//! Services are then constructed and boot-hooked in that order: a service's
//! boot hook runs only after every one of its imports has booted.
//!
//! A `uses` dependency resolved from inside a factory or boot hook may not
//! lead back, through imports, to a service still under construction on the
//! same task: that resolution would wait on itself, so it is reported as a
//! cyclic dependency instead.

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use chroma_core::{RegistrationError, ResolutionError};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::registry::{method_handler, Handler};
use crate::scheduler::{JobContext, JobDescriptor};

type Instance = Arc<dyn Any + Send + Sync>;
type Factory = Box<dyn Fn(&Dependencies) -> anyhow::Result<Instance> + Send + Sync>;
type BootHook = Box<dyn Fn(Instance) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

tokio::task_local! {
    /// Services being constructed or booted by the current task, outermost first
    static IN_FLIGHT: Vec<TypeTag>;
}

// ----------------------------------------------------------------------------
// Service Trait
// ----------------------------------------------------------------------------

/// A type the container can construct
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Runs once, after every imported service has booted
    async fn boot(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Readable name of `T` with module paths stripped, e.g. `Store<Wallet>`
pub fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let mut out = String::with_capacity(full.len());
    let mut segment = String::new();
    let mut chars = full.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            ':' if chars.peek() == Some(&':') => {
                chars.next();
                segment.clear();
            }
            c if c.is_alphanumeric() || c == '_' => segment.push(c),
            c => {
                out.push_str(&segment);
                segment.clear();
                out.push(c);
            }
        }
    }
    out.push_str(&segment);
    out
}

#[derive(Debug, Clone)]
struct TypeTag {
    id: TypeId,
    name: String,
}

impl TypeTag {
    fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: short_type_name::<T>(),
        }
    }
}

// ----------------------------------------------------------------------------
// Bindings
// ----------------------------------------------------------------------------

/// A message handler declared on a service, bound once the service exists
pub struct HandlerBinding {
    pub key: String,
    make: Box<dyn FnOnce(Instance) -> Option<Arc<dyn Handler>> + Send + Sync>,
}

impl HandlerBinding {
    /// Build the handler for a resolved instance of the declaring service
    pub fn bind(self, instance: Instance) -> Option<Arc<dyn Handler>> {
        (self.make)(instance)
    }
}

/// A scheduled job declared on a service
pub struct JobBinding {
    pub name: String,
    pub schedule: String,
    make: Box<dyn FnOnce(Instance) -> Option<Arc<dyn crate::scheduler::Job>> + Send + Sync>,
}

impl JobBinding {
    /// Build the job descriptor for a resolved instance of the declaring service
    pub fn bind(
        self,
        instance: Instance,
    ) -> Option<Result<JobDescriptor, chroma_core::SchedulerError>> {
        let job = (self.make)(instance)?;
        Some(JobDescriptor::new(self.name, &self.schedule, job))
    }
}

/// Handlers and jobs declared by one service
pub struct ServiceBindings {
    pub type_id: TypeId,
    pub service: String,
    pub handlers: Vec<HandlerBinding>,
    pub jobs: Vec<JobBinding>,
}

// ----------------------------------------------------------------------------
// Service Descriptor
// ----------------------------------------------------------------------------

/// How to construct one service type, and what it depends on
pub struct ServiceDescriptor {
    tag: TypeTag,
    imports: Vec<TypeTag>,
    uses: Vec<TypeTag>,
    factory: Factory,
    boot: BootHook,
    handlers: Vec<HandlerBinding>,
    jobs: Vec<JobBinding>,
}

impl ServiceDescriptor {
    /// Describe a service built by `factory`
    pub fn new<T, F>(factory: F) -> ServiceBuilder<T>
    where
        T: Service,
        F: Fn(&Dependencies) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let factory: Factory = Box::new(move |deps| Ok(Arc::new(factory(deps)?) as Instance));
        let boot: BootHook = Box::new(|instance: Instance| {
            async move {
                match instance.downcast::<T>() {
                    Ok(service) => service.boot().await,
                    Err(_) => Ok(()),
                }
            }
            .boxed()
        });
        ServiceBuilder {
            descriptor: ServiceDescriptor {
                tag: TypeTag::of::<T>(),
                imports: Vec::new(),
                uses: Vec::new(),
                factory,
                boot,
                handlers: Vec::new(),
                jobs: Vec::new(),
            },
            _marker: PhantomData,
        }
    }

    /// Describe a service with a `Default` constructor and no dependencies
    pub fn of<T: Service + Default>() -> ServiceBuilder<T> {
        Self::new(|_| Ok(T::default()))
    }

    pub fn name(&self) -> &str {
        &self.tag.name
    }

    pub fn type_id(&self) -> TypeId {
        self.tag.id
    }

    /// Names of the imported services, in declaration order
    pub fn import_names(&self) -> Vec<String> {
        self.imports.iter().map(|tag| tag.name.clone()).collect()
    }

    /// Split off the handler and job declarations
    pub fn take_bindings(&mut self) -> ServiceBindings {
        ServiceBindings {
            type_id: self.tag.id,
            service: self.tag.name.clone(),
            handlers: std::mem::take(&mut self.handlers),
            jobs: std::mem::take(&mut self.jobs),
        }
    }
}

impl core::fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("name", &self.tag.name)
            .field("imports", &self.import_names())
            .field(
                "uses",
                &self.uses.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Typed builder of a `ServiceDescriptor`
pub struct ServiceBuilder<T> {
    descriptor: ServiceDescriptor,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Service> ServiceBuilder<T> {
    /// Declare a service that must be constructed and booted first
    pub fn imports<D: Send + Sync + 'static>(mut self) -> Self {
        self.descriptor.imports.push(TypeTag::of::<D>());
        self
    }

    /// Declare a service that is resolved lazily on first access
    pub fn uses<D: Send + Sync + 'static>(mut self) -> Self {
        self.descriptor.uses.push(TypeTag::of::<D>());
        self
    }

    /// Answer `key` with `method` of the constructed service
    pub fn handler<Req, Res, F, Fut>(mut self, key: impl Into<String>, method: F) -> Self
    where
        Req: serde::de::DeserializeOwned + Send + 'static,
        Res: serde::Serialize + Send + 'static,
        F: Fn(Arc<T>, Req) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Res>> + Send + 'static,
    {
        self.descriptor.handlers.push(HandlerBinding {
            key: key.into(),
            make: Box::new(move |instance: Instance| {
                let service = instance.downcast::<T>().ok()?;
                Some(method_handler(service, method))
            }),
        });
        self
    }

    /// Run `method` of the constructed service on a cron schedule
    pub fn job<F, Fut>(mut self, name: impl Into<String>, schedule: impl Into<String>, method: F) -> Self
    where
        F: Fn(Arc<T>, JobContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.descriptor.jobs.push(JobBinding {
            name: name.into(),
            schedule: schedule.into(),
            make: Box::new(move |instance: Instance| {
                let service = instance.downcast::<T>().ok()?;
                Some(crate::scheduler::service_job(service, method))
            }),
        });
        self
    }

    pub fn build(self) -> ServiceDescriptor {
        self.descriptor
    }
}

impl<T: Service> From<ServiceBuilder<T>> for ServiceDescriptor {
    fn from(builder: ServiceBuilder<T>) -> Self {
        builder.build()
    }
}

// ----------------------------------------------------------------------------
// Dependencies
// ----------------------------------------------------------------------------

/// What a factory may access: its imports, and lazy handles to its uses
pub struct Dependencies {
    service: String,
    imports: HashMap<TypeId, Instance>,
    uses: HashSet<TypeId>,
    container: Weak<ContainerInner>,
}

impl Dependencies {
    /// An imported service, already constructed and booted
    pub fn get<D: Send + Sync + 'static>(&self) -> Result<Arc<D>, ResolutionError> {
        self.imports
            .get(&TypeId::of::<D>())
            .cloned()
            .and_then(|instance| instance.downcast::<D>().ok())
            .ok_or_else(|| ResolutionError::UndeclaredDependency {
                service: self.service.clone(),
                dependency: short_type_name::<D>(),
            })
    }

    /// A lazily resolved handle to a used service
    pub fn lazy<D: Send + Sync + 'static>(&self) -> Result<Lazy<D>, ResolutionError> {
        if !self.uses.contains(&TypeId::of::<D>()) {
            return Err(ResolutionError::UndeclaredDependency {
                service: self.service.clone(),
                dependency: short_type_name::<D>(),
            });
        }
        Ok(Lazy {
            container: self.container.clone(),
            cell: Arc::new(OnceCell::new()),
        })
    }
}

/// Handle to a `uses` dependency, resolved on first `get`
pub struct Lazy<T> {
    container: Weak<ContainerInner>,
    cell: Arc<OnceCell<Arc<T>>>,
}

impl<T> Clone for Lazy<T> {
    fn clone(&self) -> Self {
        Self {
            container: self.container.clone(),
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: Send + Sync + 'static> Lazy<T> {
    pub async fn get(&self) -> Result<Arc<T>, ResolutionError> {
        self.cell
            .get_or_try_init(|| async {
                let inner = self
                    .container
                    .upgrade()
                    .ok_or_else(|| ResolutionError::ContainerDropped {
                        service: short_type_name::<T>(),
                    })?;
                Container { inner }.resolve::<T>().await
            })
            .await
            .cloned()
    }

    /// Whether the dependency has been resolved through this handle
    pub fn is_resolved(&self) -> bool {
        self.cell.initialized()
    }
}

// ----------------------------------------------------------------------------
// Container
// ----------------------------------------------------------------------------

struct ContainerInner {
    descriptors: Mutex<HashMap<TypeId, Arc<ServiceDescriptor>>>,
    order: Mutex<Vec<TypeId>>,
    instances: Mutex<HashMap<TypeId, Arc<OnceCell<Instance>>>>,
    names: Mutex<HashMap<TypeId, String>>,
}

/// Singleton scope for services. Clones share the same instances.
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Container {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ContainerInner {
                descriptors: Mutex::new(HashMap::new()),
                order: Mutex::new(Vec::new()),
                instances: Mutex::new(HashMap::new()),
                names: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register how to construct a service type
    pub fn register(&self, descriptor: impl Into<ServiceDescriptor>) -> Result<(), RegistrationError> {
        let descriptor = descriptor.into();
        let id = descriptor.tag.id;
        if self.is_registered_id(id) {
            return Err(RegistrationError::DuplicateService {
                service: descriptor.tag.name,
            });
        }
        debug!(
            "Registered service {} (imports: {:?})",
            descriptor.tag.name,
            descriptor.import_names()
        );
        lock(&self.inner.names).insert(id, descriptor.tag.name.clone());
        lock(&self.inner.order).push(id);
        lock(&self.inner.descriptors).insert(id, Arc::new(descriptor));
        Ok(())
    }

    /// Register an already constructed singleton
    pub fn provide<T: Send + Sync + 'static>(&self, instance: Arc<T>) -> Result<(), RegistrationError> {
        let id = TypeId::of::<T>();
        let name = short_type_name::<T>();
        if self.is_registered_id(id) {
            return Err(RegistrationError::DuplicateService { service: name });
        }
        debug!("Provided instance of {}", name);
        lock(&self.inner.names).insert(id, name);
        lock(&self.inner.instances).insert(id, Arc::new(OnceCell::from(instance as Instance)));
        Ok(())
    }

    pub fn is_registered<T: 'static>(&self) -> bool {
        self.is_registered_id(TypeId::of::<T>())
    }

    fn is_registered_id(&self, id: TypeId) -> bool {
        lock(&self.inner.names).contains_key(&id)
    }

    /// An instance that has already been resolved or provided
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.instance(TypeId::of::<T>())
            .and_then(|instance| instance.downcast::<T>().ok())
    }

    /// Type-erased access to an already resolved instance
    pub fn instance(&self, id: TypeId) -> Option<Instance> {
        lock(&self.inner.instances)
            .get(&id)
            .and_then(|cell| cell.get().cloned())
    }

    /// Resolve `T` and everything it imports
    pub async fn resolve<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, ResolutionError> {
        let name = short_type_name::<T>();
        let instance = self.resolve_id(TypeId::of::<T>(), &name).await?;
        instance
            .downcast::<T>()
            .map_err(|_| ResolutionError::UnknownService { service: name })
    }

    /// Resolve every registered service in registration order
    pub async fn resolve_all(&self) -> Result<(), ResolutionError> {
        let order = lock(&self.inner.order).clone();
        for id in order {
            let name = self.name_of(id);
            self.resolve_id(id, &name).await?;
        }
        Ok(())
    }

    /// Names of the services `T` needs, in construction order, ending with `T`
    pub fn plan<T: 'static>(&self) -> Result<Vec<String>, ResolutionError> {
        let order = self.plan_id(TypeId::of::<T>(), &short_type_name::<T>())?;
        Ok(order.into_iter().map(|id| self.name_of(id)).collect())
    }

    fn name_of(&self, id: TypeId) -> String {
        lock(&self.inner.names)
            .get(&id)
            .cloned()
            .unwrap_or_else(|| format!("{:?}", id))
    }

    async fn resolve_id(&self, id: TypeId, name: &str) -> Result<Instance, ResolutionError> {
        if let Some(instance) = self.instance(id) {
            return Ok(instance);
        }

        let order = self.plan_id(id, name)?;
        let in_flight = IN_FLIGHT.try_with(Vec::clone).unwrap_or_default();
        let mut resolved = None;
        for step in order {
            if let Some(start) = in_flight.iter().position(|tag| tag.id == step) {
                let mut cycle: Vec<String> =
                    in_flight[start..].iter().map(|tag| tag.name.clone()).collect();
                cycle.extend(self.import_path(id, step));
                return Err(ResolutionError::Cyclic { cycle });
            }
            let cell = self.cell(step);
            let instance = cell
                .get_or_try_init(|| self.instantiate(step))
                .await?
                .clone();
            resolved = Some(instance);
        }
        resolved.ok_or_else(|| ResolutionError::UnknownService {
            service: name.to_string(),
        })
    }

    /// Service names along an import chain from `from` to `to`, both included
    fn import_path(&self, from: TypeId, to: TypeId) -> Vec<String> {
        fn walk(
            at: TypeId,
            to: TypeId,
            descriptors: &HashMap<TypeId, Arc<ServiceDescriptor>>,
            seen: &mut HashSet<TypeId>,
            path: &mut Vec<TypeId>,
        ) -> bool {
            path.push(at);
            if at == to {
                return true;
            }
            if seen.insert(at) {
                if let Some(descriptor) = descriptors.get(&at) {
                    for import in &descriptor.imports {
                        if walk(import.id, to, descriptors, seen, path) {
                            return true;
                        }
                    }
                }
            }
            path.pop();
            false
        }

        let descriptors = lock(&self.inner.descriptors).clone();
        let mut path = Vec::new();
        if !walk(from, to, &descriptors, &mut HashSet::new(), &mut path) {
            path = vec![from, to];
        }
        path.into_iter().map(|id| self.name_of(id)).collect()
    }

    fn cell(&self, id: TypeId) -> Arc<OnceCell<Instance>> {
        Arc::clone(lock(&self.inner.instances).entry(id).or_default())
    }

    /// Topological order of the import graph below `root`
    fn plan_id(&self, root: TypeId, root_name: &str) -> Result<Vec<TypeId>, ResolutionError> {
        let descriptors = lock(&self.inner.descriptors).clone();
        let provided: HashSet<TypeId> = lock(&self.inner.instances)
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(id, _)| *id)
            .collect();

        let mut order = Vec::new();
        let mut done = HashSet::new();
        let mut path: Vec<TypeTag> = Vec::new();
        let root = TypeTag {
            id: root,
            name: root_name.to_string(),
        };
        visit(&root, &descriptors, &provided, &mut path, &mut done, &mut order)?;
        Ok(order)
    }

    async fn instantiate(&self, id: TypeId) -> Result<Instance, ResolutionError> {
        let descriptor = lock(&self.inner.descriptors)
            .get(&id)
            .cloned()
            .ok_or_else(|| ResolutionError::UnknownService {
                service: self.name_of(id),
            })?;
        let service = descriptor.tag.name.clone();

        let mut imports = HashMap::new();
        for tag in &descriptor.imports {
            let instance = self.instance(tag.id).ok_or_else(|| ResolutionError::UnknownService {
                service: tag.name.clone(),
            })?;
            imports.insert(tag.id, instance);
        }
        let deps = Dependencies {
            service: service.clone(),
            imports,
            uses: descriptor.uses.iter().map(|tag| tag.id).collect(),
            container: Arc::downgrade(&self.inner),
        };

        let mut in_flight = IN_FLIGHT.try_with(Vec::clone).unwrap_or_default();
        in_flight.push(descriptor.tag.clone());

        let instance = IN_FLIGHT
            .scope(in_flight, async {
                debug!("Constructing service {}", service);
                let instance = (descriptor.factory)(&deps).map_err(|e| {
                    resolution_error(e, |reason| ResolutionError::Construction {
                        service: service.clone(),
                        reason,
                    })
                })?;

                debug!("Booting service {}", service);
                (descriptor.boot)(Arc::clone(&instance))
                    .await
                    .map_err(|e| {
                        resolution_error(e, |reason| ResolutionError::BootFailed {
                            service: service.clone(),
                            reason,
                        })
                    })?;
                Ok::<_, ResolutionError>(instance)
            })
            .await?;

        info!("Service {} ready", service);
        Ok(instance)
    }
}

/// Keep resolution errors raised by nested lookups; wrap anything else
fn resolution_error(
    err: anyhow::Error,
    wrap: impl FnOnce(String) -> ResolutionError,
) -> ResolutionError {
    match err.downcast::<ResolutionError>() {
        Ok(err) => err,
        Err(err) => wrap(format!("{:#}", err)),
    }
}

/// Depth-first post-order walk; `path` holds the services being visited
fn visit(
    tag: &TypeTag,
    descriptors: &HashMap<TypeId, Arc<ServiceDescriptor>>,
    provided: &HashSet<TypeId>,
    path: &mut Vec<TypeTag>,
    done: &mut HashSet<TypeId>,
    order: &mut Vec<TypeId>,
) -> Result<(), ResolutionError> {
    if done.contains(&tag.id) {
        return Ok(());
    }
    if let Some(start) = path.iter().position(|entry| entry.id == tag.id) {
        let mut cycle: Vec<String> = path[start..].iter().map(|t| t.name.clone()).collect();
        cycle.push(tag.name.clone());
        return Err(ResolutionError::Cyclic { cycle });
    }

    if provided.contains(&tag.id) {
        done.insert(tag.id);
        order.push(tag.id);
        return Ok(());
    }

    let descriptor = descriptors
        .get(&tag.id)
        .ok_or_else(|| ResolutionError::UnknownService {
            service: tag.name.clone(),
        })?;

    path.push(tag.clone());
    for import in &descriptor.imports {
        visit(import, descriptors, provided, path, done, order)?;
    }
    path.pop();

    done.insert(tag.id);
    order.push(tag.id);
    Ok(())
}

impl core::fmt::Debug for Container {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut services: Vec<String> = lock(&self.inner.names).values().cloned().collect();
        services.sort();
        f.debug_struct("Container")
            .field("services", &services)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
