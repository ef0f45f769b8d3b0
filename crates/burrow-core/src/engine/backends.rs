use futures::future::LocalBoxFuture;

use super::Engine;
use crate::backend::{Backend, BackendFactory, BackendInit};
use crate::error::{Error, Result};

// Backend registry & selection
//
// Factories are registered under a name with a priority. Instances are
// created lazily:
//
//   backend() / run_kernel()   sync path, tries names by descending priority;
//                              an async factory leaves a pending init and the
//                              call fails with BackendNotInitialized
//   ready().await              same order, awaiting async factories and
//                              falling back when one fails
//   set_backend(name).await    explicit switch
//
// Every async initialization is stamped with an init id. `reset` and
// `remove_backend` bump the counter, so a completion that arrives after the
// engine moved on is recognised as stale and its backend disposed.

pub(super) struct RegistryEntry {
    factory: BackendFactory,
    priority: i32,
    order: u64,
}

/// Outcome of invoking one backend factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// The backend instance is available now.
    Ready,
    /// The factory failed; the failure was logged.
    Failed,
    /// The factory returned a future, stamped with `init_id`.
    Pending { init_id: u64 },
}

/// An async backend initialization that has not completed yet.
pub struct PendingInit {
    pub name: String,
    pub init_id: u64,
    pub future: LocalBoxFuture<'static, Result<Box<dyn Backend>>>,
}

impl std::fmt::Debug for PendingInit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingInit")
            .field("name", &self.name)
            .field("init_id", &self.init_id)
            .finish()
    }
}

impl Engine {
    /// Register a backend factory under `name`.
    ///
    /// Returns false (and keeps the existing factory) if the name is taken.
    pub fn register_backend<F>(&mut self, name: &str, factory: F, priority: i32) -> bool
    where
        F: Fn() -> Result<BackendInit> + 'static,
    {
        if self.registry.contains_key(name) {
            log::warn!("{} backend was already registered, reusing existing factory", name);
            return false;
        }
        let order = self.next_registration;
        self.next_registration += 1;
        self.registry.insert(
            name.to_string(),
            RegistryEntry {
                factory: Box::new(factory),
                priority,
                order,
            },
        );
        true
    }

    /// Registered backend names by descending priority (ties keep
    /// registration order).
    pub fn sorted_backends(&self) -> Result<Vec<String>> {
        if self.registry.is_empty() {
            return Err(Error::NoBackendsRegistered);
        }
        let mut entries: Vec<(&String, &RegistryEntry)> = self.registry.iter().collect();
        entries.sort_by(|(_, a), (_, b)| b.priority.cmp(&a.priority).then(a.order.cmp(&b.order)));
        Ok(entries.into_iter().map(|(name, _)| name.clone()).collect())
    }

    /// Names of all registered factories.
    pub fn registered_backend_names(&self) -> Vec<String> {
        self.registry.keys().cloned().collect()
    }

    /// Names of the backends that currently have an instance.
    pub fn backend_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.instances.keys().cloned().collect();
        names.sort();
        names
    }

    /// Name of the active backend, if one has been selected.
    pub fn backend_name(&self) -> Option<&str> {
        self.active_backend.as_deref()
    }

    /// Priority a backend was registered with.
    pub fn backend_priority(&self, name: &str) -> Option<i32> {
        self.registry.get(name).map(|e| e.priority)
    }

    /// The instance registered under `name`, instantiating it synchronously
    /// if needed. Returns None for unknown names, failing factories and
    /// async factories that have not completed.
    pub fn find_backend(&mut self, name: &str) -> Option<&mut dyn Backend> {
        if !self.instances.contains_key(name) {
            match self.initialize_backend(name) {
                Ok(InitOutcome::Ready) => {}
                _ => return None,
            }
        }
        self.instances.get_mut(name).map(|b| &mut **b as &mut dyn Backend)
    }

    /// The active backend, resolving one by priority on first use.
    pub fn backend(&mut self) -> Result<&mut dyn Backend> {
        let name = self.ensure_backend()?;
        self.instances
            .get_mut(&name)
            .map(|b| &mut **b as &mut dyn Backend)
            .ok_or(Error::BackendNotFound(name))
    }

    /// Invoke the factory registered under `name`.
    ///
    /// A synchronous success stores the instance. An async factory is left
    /// pending (see [`take_pending_init`](Engine::take_pending_init)); any
    /// earlier pending init becomes stale.
    pub fn initialize_backend(&mut self, name: &str) -> Result<InitOutcome> {
        let entry = self
            .registry
            .get(name)
            .ok_or_else(|| Error::BackendNotFound(name.to_string()))?;
        match (entry.factory)() {
            Ok(BackendInit::Ready(backend)) => {
                self.instances.insert(name.to_string(), backend);
                Ok(InitOutcome::Ready)
            }
            Ok(BackendInit::Pending(future)) => {
                self.pending_init_id += 1;
                let init_id = self.pending_init_id;
                self.initializing = Some((name.to_string(), init_id));
                self.pending_init = Some(PendingInit {
                    name: name.to_string(),
                    init_id,
                    future,
                });
                Ok(InitOutcome::Pending { init_id })
            }
            Err(e) => {
                log::warn!("initialization of backend {} failed: {}", name, e);
                Ok(InitOutcome::Failed)
            }
        }
    }

    /// Take the in-flight async initialization so the caller can drive it.
    ///
    /// The engine keeps treating the backend as initializing until the
    /// result is handed back through
    /// [`complete_initialization`](Engine::complete_initialization).
    pub fn take_pending_init(&mut self) -> Option<PendingInit> {
        self.pending_init.take()
    }

    /// Deliver the result of an async backend factory.
    ///
    /// Returns true if the backend was installed. Completions whose
    /// `init_id` is older than the latest initialization are discarded and
    /// the backend they produced is disposed.
    pub fn complete_initialization(
        &mut self,
        name: &str,
        init_id: u64,
        result: Result<Box<dyn Backend>>,
    ) -> bool {
        if init_id < self.pending_init_id {
            log::debug!(
                "discarding stale initialization of backend {} (init {} < {})",
                name,
                init_id,
                self.pending_init_id
            );
            if let Ok(mut backend) = result {
                backend.dispose();
            }
            return false;
        }
        if matches!(&self.initializing, Some((_, id)) if *id == init_id) {
            self.initializing = None;
        }
        match result {
            Ok(backend) => {
                self.instances.insert(name.to_string(), backend);
                true
            }
            Err(e) => {
                log::warn!("initialization of backend {} failed: {}", name, e);
                false
            }
        }
    }

    /// Switch to the backend registered under `name`, instantiating it first
    /// if needed. Returns false if its factory fails. Any async init still
    /// in flight is invalidated by the switch.
    pub async fn set_backend(&mut self, name: &str) -> Result<bool> {
        self.await_pending_init().await;
        if !self.registry.contains_key(name) {
            return Err(Error::BackendNotFound(name.to_string()));
        }
        if !self.instances.contains_key(name) {
            match self.initialize_backend(name)? {
                InitOutcome::Ready => {}
                InitOutcome::Failed => return Ok(false),
                InitOutcome::Pending { .. } => {
                    if !self.await_pending_init().await {
                        return Ok(false);
                    }
                }
            }
        }
        self.cancel_pending_init();
        self.activate_backend(name);
        Ok(true)
    }

    /// Wait until a backend is active, trying registered backends by
    /// descending priority and falling back past failing factories.
    pub async fn ready(&mut self) -> Result<()> {
        self.await_pending_init().await;
        if self.active_backend.is_some() {
            return Ok(());
        }
        for name in self.sorted_backends()? {
            let available = if self.instances.contains_key(&name) {
                true
            } else {
                match self.initialize_backend(&name)? {
                    InitOutcome::Ready => true,
                    InitOutcome::Failed => false,
                    InitOutcome::Pending { .. } => self.await_pending_init().await,
                }
            };
            if available {
                self.cancel_pending_init();
                self.activate_backend(&name);
                return Ok(());
            }
        }
        Err(Error::NoBackendAvailable)
    }

    /// Dispose a backend's kernel state and instance and forget its factory.
    pub fn remove_backend(&mut self, name: &str) -> Result<()> {
        if !self.registry.contains_key(name) {
            return Err(Error::BackendNotFound(name.to_string()));
        }
        self.dispose_backend_instance(name);
        self.registry.remove(name);
        if matches!(&self.initializing, Some((pending, _)) if pending == name) {
            self.cancel_pending_init();
        }
        if self.active_backend.as_deref() == Some(name) {
            self.active_backend = None;
        }
        log::info!("removed backend {}", name);
        Ok(())
    }

    // Internals

    /// Name of the active backend, resolving one synchronously if needed.
    pub(crate) fn ensure_backend(&mut self) -> Result<String> {
        if let Some((name, _)) = &self.initializing {
            return Err(Error::BackendNotInitialized(name.clone()));
        }
        if let Some(name) = &self.active_backend {
            return Ok(name.clone());
        }
        for name in self.sorted_backends()? {
            if !self.instances.contains_key(&name) {
                match self.initialize_backend(&name)? {
                    InitOutcome::Ready => {}
                    InitOutcome::Failed => continue,
                    InitOutcome::Pending { .. } => {
                        return Err(Error::BackendNotInitialized(name));
                    }
                }
            }
            self.activate_backend(&name);
            return Ok(name);
        }
        Err(Error::NoBackendAvailable)
    }

    /// Make sure `name` has an instance, instantiating it synchronously.
    pub(crate) fn ensure_instance(&mut self, name: &str) -> Result<()> {
        if self.instances.contains_key(name) {
            return Ok(());
        }
        match self.initialize_backend(name)? {
            InitOutcome::Ready => Ok(()),
            InitOutcome::Pending { .. } => Err(Error::BackendNotInitialized(name.to_string())),
            InitOutcome::Failed => Err(Error::msg(format!(
                "backend {} failed to initialize",
                name
            ))),
        }
    }

    fn activate_backend(&mut self, name: &str) {
        if let Some(backend) = self.instances.get_mut(name) {
            for config in self.kernels.kernels_for_backend(name) {
                if let Some(setup) = &config.setup {
                    setup(&mut **backend);
                }
            }
        }
        self.active_backend = Some(name.to_string());
        self.profiler.reset();
        log::info!("using backend {}", name);
    }

    /// Invalidate any in-flight async init; its completion will be stale.
    fn cancel_pending_init(&mut self) {
        if self.initializing.is_none() && self.pending_init.is_none() {
            return;
        }
        self.pending_init_id += 1;
        if let Some((name, _)) = self.initializing.take() {
            log::debug!("cancelled pending initialization of backend {}", name);
        }
        self.pending_init = None;
    }

    async fn await_pending_init(&mut self) -> bool {
        match self.pending_init.take() {
            Some(pending) => {
                let result = pending.future.await;
                self.complete_initialization(&pending.name, pending.init_id, result)
            }
            None => false,
        }
    }

    pub(super) fn dispose_backend_instance(&mut self, name: &str) {
        if let Some(mut backend) = self.instances.remove(name) {
            for config in self.kernels.kernels_for_backend(name) {
                if let Some(dispose) = &config.dispose {
                    dispose(&mut *backend);
                }
            }
            backend.dispose();
        }
    }
}
