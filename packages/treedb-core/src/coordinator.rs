//! Session-gated access to hierarchy stores.
//!
//! Request handlers go through [`AccessCoordinator`] for everything: it owns
//! the session registry, opens one [`HierarchyStore`] per resource, and is the
//! single place where error values become transport status codes.
//!
//! Changing configuration is a three-step exchange with the operator:
//! try [`AccessCoordinator::open_session`] without force, show the
//! [`Error::Conflict`] to the operator, and only retry with `force = true`
//! after they confirm. Nothing here forces on the caller's behalf.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use parking_lot::Mutex;

use crate::config::{resolve_path, Config, ResourceKey, TableSchema};
use crate::error::{Error, Result};
use crate::hierarchy::HierarchyStore;
use crate::ids::SessionId;
use crate::meta::TableListing;
use crate::session::{Session, SessionRegistry};
use crate::settings::Settings;
use crate::traits::{Clock, NodeStore, StoreBackend, SystemClock};

type SharedStore<S> = Arc<Mutex<HierarchyStore<S>>>;

struct CachedStore<S: NodeStore> {
    schema: TableSchema,
    store: SharedStore<S>,
}

/// Outcome of [`AccessCoordinator::update_session`].
#[derive(Clone, Debug, PartialEq)]
pub struct SessionUpdate {
    pub session: Session,
    /// `true` when the session id was unknown and a fresh session was forced.
    pub created: bool,
}

pub struct AccessCoordinator<B: StoreBackend, C: Clock = SystemClock> {
    registry: SessionRegistry<C>,
    backend: B,
    base_dir: PathBuf,
    stores: Mutex<HashMap<ResourceKey, CachedStore<B::Store>>>,
}

impl<B: StoreBackend> AccessCoordinator<B, SystemClock> {
    pub fn from_settings(backend: B, settings: &Settings) -> Self {
        Self::new(
            backend,
            SystemClock,
            settings.session_timeout,
            settings.base_dir.clone(),
        )
    }
}

impl<B: StoreBackend, C: Clock> AccessCoordinator<B, C> {
    pub fn new(backend: B, clock: C, idle_timeout: Duration, base_dir: PathBuf) -> Self {
        Self {
            registry: SessionRegistry::new(clock, idle_timeout),
            backend,
            base_dir,
            stores: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &SessionRegistry<C> {
        &self.registry
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Open the store named by `config` and claim its resource.
    ///
    /// The store is opened before the registry is touched, so a failed open
    /// neither claims the resource nor evicts its holder.
    pub fn open_session(&self, config: Config, force: bool) -> Result<Session> {
        let config = config.normalized(&self.base_dir)?;
        let store = self.prepare_store(&config)?;
        let session = self.registry.create(config, force)?;
        self.install(&session.config, store);
        Ok(session)
    }

    /// Rebind a session to a new configuration.
    ///
    /// With `force`, an unknown or expired session id is replaced by a newly
    /// created session and a holder of the target resource is evicted.
    pub fn update_session(&self, id: &SessionId, config: Config, force: bool) -> Result<SessionUpdate> {
        let config = config.normalized(&self.base_dir)?;
        let store = self.prepare_store(&config)?;
        let rebind = match self.registry.update(id, config.clone(), force) {
            Ok(rebind) => rebind,
            Err(Error::Expired(_)) if force => {
                info!("session {id} unknown; force-creating a replacement");
                let session = self.registry.create(config, true)?;
                self.install(&session.config, store);
                return Ok(SessionUpdate {
                    session,
                    created: true,
                });
            }
            Err(err) => return Err(err),
        };

        self.install(&rebind.session.config, store);
        if let Some(old_key) = &rebind.released {
            self.release_if_unheld(old_key);
        }
        Ok(SessionUpdate {
            session: rebind.session,
            created: false,
        })
    }

    /// Release a session. Unknown ids are ignored.
    pub fn close_session(&self, id: &SessionId) -> bool {
        match self.registry.revoke(id) {
            Some(session) => {
                self.release_if_unheld(&session.resource_key);
                true
            }
            None => false,
        }
    }

    pub fn list_sessions(&self) -> Vec<Session> {
        self.registry.list()
    }

    /// Expire idle sessions now and drop stores nobody holds any more.
    pub fn sweep(&self) -> Vec<SessionId> {
        let swept = self.registry.sweep(self.registry.now());
        if !swept.is_empty() {
            self.stores
                .lock()
                .retain(|key, _| self.registry.is_held(key));
        }
        swept
    }

    /// Tables of the data source at `path`, resolved against the base
    /// directory. Needs no session, so clients can pick a table before
    /// opening one.
    pub fn list_tables(&self, path: &Path) -> Result<TableListing> {
        if path.as_os_str().is_empty() {
            return Err(Error::Validation("data source path is required".into()));
        }
        let resolved = resolve_path(&self.base_dir, path);
        let tables = self.backend.list_tables(&resolved)?;
        Ok(TableListing {
            data_source_path: resolved,
            tables,
        })
    }

    /// The configuration of a live session; renews its lease.
    pub fn authorize(&self, id: &SessionId) -> Result<Config> {
        self.registry.get(id).map(|session| session.config)
    }

    /// Run `f` against the session's store if the session is live.
    pub fn with_resource<T>(
        &self,
        id: &SessionId,
        f: impl FnOnce(&mut HierarchyStore<B::Store>) -> Result<T>,
    ) -> Result<T> {
        let config = self.authorize(id)?;
        let store = self.store_for(&config)?;
        let mut guard = store.lock();
        f(&mut guard)
    }

    /// The cached store for `config`, or a freshly opened one that is not
    /// cached yet.
    fn prepare_store(&self, config: &Config) -> Result<SharedStore<B::Store>> {
        let key = config.resource_key();
        let schema = config.schema();
        if let Some(cached) = self.stores.lock().get(&key) {
            if cached.schema == schema {
                return Ok(Arc::clone(&cached.store));
            }
        }
        let store = self.backend.open(config).map_err(|err| {
            warn!("opening {key} failed: {err}");
            err
        })?;
        Ok(Arc::new(Mutex::new(HierarchyStore::new(store))))
    }

    fn install(&self, config: &Config, store: SharedStore<B::Store>) {
        self.stores.lock().insert(
            config.resource_key(),
            CachedStore {
                schema: config.schema(),
                store,
            },
        );
    }

    fn store_for(&self, config: &Config) -> Result<SharedStore<B::Store>> {
        let key = config.resource_key();
        let schema = config.schema();
        let mut stores = self.stores.lock();
        if let Some(cached) = stores.get(&key) {
            if cached.schema == schema {
                return Ok(Arc::clone(&cached.store));
            }
        }
        let store = Arc::new(Mutex::new(HierarchyStore::new(self.backend.open(config)?)));
        stores.insert(
            key,
            CachedStore {
                schema,
                store: Arc::clone(&store),
            },
        );
        Ok(store)
    }

    fn release_if_unheld(&self, key: &ResourceKey) {
        if !self.registry.is_held(key) {
            self.stores.lock().remove(key);
        }
    }
}

/// HTTP status for an error value.
pub fn status_code(err: &Error) -> u16 {
    match err {
        Error::Validation(_) => 400,
        Error::NotFound(_) => 404,
        Error::Cycle { .. } | Error::Conflict { .. } => 409,
        Error::Expired(_) => 410,
        Error::Store(_) | Error::RenumberAborted { .. } => 500,
    }
}
