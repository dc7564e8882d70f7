//! Process registry.
//!
//! A [`Registry`] maps names to handles, such as a [`ServerRef`][crate::gen_server::ServerRef], so that processes can
//! be found by name rather than passing handles around explicitly. Handles are stored type-erased and retrieved by
//! type with [`Registry::lookup`].
//!
//! Registrations made through [`Registry::register_scoped`], or by wrapping a process with [`Registered`], are removed
//! automatically when the registering process stops, for whatever reason, so the registry never points at a process
//! that is no longer running.
//!
//! Registries are ordinary values: construct one at startup and hand clones of it to whatever needs it. A process-wide
//! instance is available through [`Registry::global`] for applications that prefer it.

use std::{
    any::Any,
    fmt,
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
};

use async_trait::async_trait;
use custos_error::GenericError;
use snafu::Snafu;
use tracing::debug;

use crate::{
    collections::FastHashMap,
    runtime::{ChildSpec, ProcessContext, ShutdownStrategy, Supervisable},
};

/// Registry errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum RegistryError {
    /// Registered names must not be empty.
    #[snafu(display("Registered names must not be empty."))]
    EmptyName,

    /// The name is already registered.
    #[snafu(display("Name '{}' is already registered.", name))]
    AlreadyRegistered {
        /// The conflicting name.
        name: String,
    },

    /// The name is not registered.
    #[snafu(display("Name '{}' is not registered.", name))]
    NotRegistered {
        /// The unknown name.
        name: String,
    },
}

struct Entry {
    handle: Arc<dyn Any + Send + Sync>,
    generation: u64,
}

#[derive(Default)]
struct RegistryState {
    entries: FastHashMap<Arc<str>, Entry>,
    next_generation: u64,
}

/// A name-to-handle directory.
///
/// Cloning a `Registry` yields another reference to the same directory.
#[derive(Clone, Default)]
pub struct Registry {
    state: Arc<Mutex<RegistryState>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the process-wide registry.
    pub fn global() -> &'static Registry {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(Registry::new)
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert<H>(&self, name: &str, handle: H) -> Result<(Arc<str>, u64), RegistryError>
    where
        H: Any + Send + Sync,
    {
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }

        let mut state = self.lock();
        if state.entries.contains_key(name) {
            return Err(RegistryError::AlreadyRegistered { name: name.to_string() });
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        let name: Arc<str> = name.into();
        state.entries.insert(
            Arc::clone(&name),
            Entry {
                handle: Arc::new(handle),
                generation,
            },
        );

        debug!(name = %name, "Registered name.");
        Ok((name, generation))
    }

    /// Registers `handle` under `name`.
    ///
    /// The registration lasts until [`unregister`][Self::unregister] is called. It is not tied to the lifetime of any
    /// process: if the process behind `handle` stops, the name keeps resolving to the stale handle. To have the name
    /// removed automatically, use [`register_scoped`][Self::register_scoped] and hold the [`Registration`] for the
    /// lifetime of the process, wrap the process in [`Registered`], or build its child spec with
    /// [`registered_child`][Self::registered_child].
    ///
    /// # Errors
    ///
    /// If `name` is empty or already registered, an error is returned.
    pub fn register<N, H>(&self, name: N, handle: H) -> Result<(), RegistryError>
    where
        N: AsRef<str>,
        H: Any + Send + Sync,
    {
        self.insert(name.as_ref(), handle).map(|_| ())
    }

    /// Registers `handle` under `name` for as long as the returned [`Registration`] is held.
    ///
    /// # Errors
    ///
    /// If `name` is empty or already registered, an error is returned.
    pub fn register_scoped<N, H>(&self, name: N, handle: H) -> Result<Registration, RegistryError>
    where
        N: AsRef<str>,
        H: Any + Send + Sync,
    {
        let (name, generation) = self.insert(name.as_ref(), handle)?;
        Ok(Registration {
            registry: self.clone(),
            name,
            generation,
        })
    }

    /// Removes the registration for `name`.
    ///
    /// # Errors
    ///
    /// If `name` is not registered, an error is returned.
    pub fn unregister<N: AsRef<str>>(&self, name: N) -> Result<(), RegistryError> {
        let name = name.as_ref();
        match self.lock().entries.remove(name) {
            Some(_) => {
                debug!(name, "Unregistered name.");
                Ok(())
            }
            None => Err(RegistryError::NotRegistered { name: name.to_string() }),
        }
    }

    /// Returns the handle registered under `name`, if any, and if it is of type `H`.
    pub fn lookup<H>(&self, name: &str) -> Option<H>
    where
        H: Any + Clone,
    {
        self.lock()
            .entries
            .get(name)
            .and_then(|entry| entry.handle.downcast_ref::<H>())
            .cloned()
    }

    /// Returns the handle registered under `name`, if any.
    ///
    /// Equivalent to [`lookup`][Self::lookup].
    pub fn whereis<H>(&self, name: &str) -> Option<H>
    where
        H: Any + Clone,
    {
        self.lookup(name)
    }

    /// Returns the type-erased handle registered under `name`, if any.
    pub fn lookup_any(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.lock().entries.get(name).map(|entry| Arc::clone(&entry.handle))
    }

    /// Returns `true` if `name` is registered.
    pub fn is_registered(&self, name: &str) -> bool {
        self.lock().entries.contains_key(name)
    }

    /// Returns every registered name, sorted.
    pub fn registered_names(&self) -> Vec<String> {
        let mut names = self
            .lock()
            .entries
            .keys()
            .map(|name| name.to_string())
            .collect::<Vec<_>>();
        names.sort_unstable();
        names
    }

    /// Wraps `spec` so that every started instance registers `handle` under `name` while it runs.
    ///
    /// The returned specification keeps the ID and restart policy of `spec`.
    pub fn registered_child<N, H>(&self, name: N, handle: H, spec: ChildSpec) -> ChildSpec
    where
        N: AsRef<str>,
        H: Any + Clone + Send + Sync,
    {
        let registry = self.clone();
        let name: Arc<str> = name.as_ref().into();
        let child_id = spec.id().to_string();
        let restart_policy = spec.restart_policy();
        ChildSpec::new(child_id, move || {
            Registered::new(registry.clone(), &*name, handle.clone(), spec.create())
        })
        .with_restart_policy(restart_policy)
    }

    fn remove_generation(&self, name: &str, generation: u64) {
        let mut state = self.lock();
        // The name may have been unregistered and registered again since, in which case it is no longer ours.
        if state.entries.get(name).is_some_and(|entry| entry.generation == generation) {
            state.entries.remove(name);
            debug!(name, "Removed scoped registration.");
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("names", &self.registered_names())
            .finish()
    }
}

/// A scoped registration.
///
/// The name is unregistered when this is dropped, unless it was already unregistered and registered again by someone
/// else in the meantime.
#[must_use = "the name is unregistered as soon as the registration is dropped"]
pub struct Registration {
    registry: Registry,
    name: Arc<str>,
    generation: u64,
}

impl Registration {
    /// Returns the registered name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove_generation(&self.name, self.generation);
    }
}

/// A process that registers a name while it runs.
///
/// Each time the wrapped process starts, `handle` is registered under `name`. The registration is removed as soon as
/// the process stops: when it returns, fails, panics, or is aborted.
///
/// Registration conflicts are process failures, which lets the supervisor retry the start later.
pub struct Registered<S, H> {
    registry: Registry,
    name: Arc<str>,
    handle: H,
    inner: S,
}

impl<S, H> Registered<S, H>
where
    S: Supervisable,
    H: Any + Clone + Send + Sync,
{
    /// Wraps `inner` so that `handle` is registered under `name` in `registry` while it runs.
    pub fn new<N: AsRef<str>>(registry: Registry, name: N, handle: H, inner: S) -> Self {
        Self {
            registry,
            name: name.as_ref().into(),
            handle,
            inner,
        }
    }
}

#[async_trait]
impl<S, H> Supervisable for Registered<S, H>
where
    S: Supervisable,
    H: Any + Clone + Send + Sync,
{
    fn shutdown_strategy(&self) -> ShutdownStrategy {
        self.inner.shutdown_strategy()
    }

    async fn serve(&mut self, ctx: ProcessContext) -> Result<(), GenericError> {
        let _registration = self.registry.register_scoped(&*self.name, self.handle.clone())?;
        self.inner.serve(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use custos_error::generic_error;
    use tokio::sync::oneshot;

    use super::*;
    use crate::{
        gen_server::{self, GenServer, ServerRef},
        runtime::{BackoffConfig, RestartPolicy, RestartStrategy, Supervisor},
    };

    struct Echo;

    #[async_trait]
    impl GenServer for Echo {
        type Call = String;
        type Reply = String;
        type Cast = ();
        type Info = ();

        async fn handle_call(&mut self, request: String) -> Result<String, GenericError> {
            Ok(request)
        }
    }

    #[test]
    fn register_lookup_unregister() {
        let registry = Registry::new();
        registry.register("svc", 42u32).unwrap();

        assert_eq!(registry.lookup::<u32>("svc"), Some(42));
        assert_eq!(registry.whereis::<String>("svc"), None);
        assert!(registry.lookup_any("svc").is_some());
        assert!(matches!(
            registry.register("svc", 7u32),
            Err(RegistryError::AlreadyRegistered { .. })
        ));
        assert!(matches!(registry.register("", 7u32), Err(RegistryError::EmptyName)));

        registry.unregister("svc").unwrap();
        assert_eq!(registry.lookup::<u32>("svc"), None);
        assert!(matches!(
            registry.unregister("svc"),
            Err(RegistryError::NotRegistered { .. })
        ));
    }

    #[test]
    fn plain_registration_outlives_scoped_ones() {
        let registry = Registry::new();
        registry.register("plain", 1u32).unwrap();
        drop(registry.register_scoped("scoped", 2u32).unwrap());

        assert_eq!(registry.lookup::<u32>("plain"), Some(1));
        assert!(!registry.is_registered("scoped"));
        assert_eq!(registry.registered_names(), vec!["plain".to_string()]);
    }

    #[test]
    fn scoped_registration_never_removes_newer_entry() {
        let registry = Registry::new();
        let registration = registry.register_scoped("svc", 1u32).unwrap();
        assert_eq!(registration.name(), "svc");

        registry.unregister("svc").unwrap();
        registry.register("svc", 2u32).unwrap();
        drop(registration);

        assert_eq!(registry.lookup::<u32>("svc"), Some(2));
        assert_eq!(registry.registered_names(), vec!["svc".to_string()]);
    }

    #[test]
    fn clones_share_entries() {
        let registry = Registry::new();
        let clone = registry.clone();
        let _registration = clone.register_scoped("a", "first").unwrap();

        assert!(registry.is_registered("a"));
        assert_eq!(registry.lookup::<&str>("a"), Some("first"));
    }

    #[tokio::test]
    async fn registration_follows_process_lifetime() {
        let registry = Registry::new();
        let (server_ref, server_spec) = gen_server::child_spec("svc", || Echo);
        let spec = registry
            .registered_child("svc", server_ref.clone(), server_spec)
            .with_restart_policy(RestartPolicy::Temporary);

        let mut sup = Supervisor::new("sup").unwrap();
        sup.add_child(spec).unwrap();
        let sup_handle = sup.handle();
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move { sup.run_with_shutdown(rx).await });

        // Wait for the child to start and register itself.
        let found = loop {
            if let Some(found) = registry.whereis::<ServerRef<Echo>>("svc") {
                break found;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert_eq!(found, server_ref);
        assert_eq!(
            found.call("hello".to_string(), Duration::from_secs(5)).await.unwrap(),
            "hello"
        );

        sup_handle.remove_child("svc").await.unwrap();
        assert!(registry.whereis::<ServerRef<Echo>>("svc").is_none());

        tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_process_is_unregistered_and_restart_registers_again() {
        let registry = Registry::new();
        let wrapper_registry = registry.clone();
        let spec = ChildSpec::new("flaky", move || Registered::new(wrapper_registry.clone(), "flaky", 1u8, Flaky))
            .with_restart_policy(RestartPolicy::Transient);

        let mut sup = Supervisor::new("sup")
            .unwrap()
            .with_restart_strategy(RestartStrategy::one_for_one().with_intensity_and_period(5, Duration::from_secs(10)))
            .with_backoff(BackoffConfig::new(Duration::from_secs(1), Duration::from_secs(1)));
        sup.add_child(spec).unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move { sup.run_with_shutdown(rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.is_registered("flaky"));

        // Fails at 100ms, and is restarted one second later.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!registry.is_registered("flaky"));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(registry.is_registered("flaky"));

        tx.send(()).unwrap();
        task.await.unwrap().unwrap();
        assert!(!registry.is_registered("flaky"));
    }

    /// Fails after 100ms on its first start only.
    struct Flaky;

    #[async_trait]
    impl Supervisable for Flaky {
        async fn serve(&mut self, mut ctx: ProcessContext) -> Result<(), GenericError> {
            static STARTS: AtomicUsize = AtomicUsize::new(0);
            if STARTS.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
                return Err(generic_error!("flaky failure"));
            }

            ctx.wait_for_shutdown().await;
            Ok(())
        }
    }
}
