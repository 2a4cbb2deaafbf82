//! Session leases over (data source, table) resources.
//!
//! The registry is the only place that decides which session may touch a
//! resource. All bookkeeping happens under one mutex so that the
//! check-evict-insert sequence of [`SessionRegistry::create`] is atomic.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::info;
use parking_lot::Mutex;

#[cfg(feature = "serde")]
use serde::Serialize;

use crate::config::{Config, ResourceKey};
use crate::error::{Error, Result};
use crate::ids::SessionId;
use crate::traits::Clock;

/// A live claim on one resource.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize), serde(rename_all = "camelCase"))]
pub struct Session {
    pub session_id: SessionId,
    pub resource_key: ResourceKey,
    pub created_at: DateTime<Utc>,
    pub last_access_at: DateTime<Utc>,
    pub config: Config,
}

/// What [`SessionRegistry::update`] did to the session's claim.
#[derive(Clone, Debug, PartialEq)]
pub struct Rebind {
    pub session: Session,
    pub previous: Config,
    pub released: Option<ResourceKey>,
    pub evicted: Option<SessionId>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, Session>,
    holders: HashMap<ResourceKey, SessionId>,
}

impl Inner {
    fn remove(&mut self, id: &SessionId) -> Option<Session> {
        let session = self.sessions.remove(id)?;
        if self.holders.get(&session.resource_key) == Some(id) {
            self.holders.remove(&session.resource_key);
        }
        Some(session)
    }

    fn expired_ids(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|s| is_idle(s, now, timeout))
            .map(|s| s.session_id.clone())
            .collect()
    }
}

fn is_idle(session: &Session, now: DateTime<Utc>, timeout: Duration) -> bool {
    if timeout.is_zero() {
        return false;
    }
    match (now - session.last_access_at).to_std() {
        Ok(idle) => idle > timeout,
        // last access lies in the future: clock went backwards
        Err(_) => false,
    }
}

pub struct SessionRegistry<C: Clock> {
    inner: Mutex<Inner>,
    clock: C,
    idle_timeout: Duration,
}

impl<C: Clock> SessionRegistry<C> {
    pub fn new(clock: C, idle_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
            idle_timeout,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Claim the resource `config` names.
    ///
    /// Without `force` a live holder makes this fail with [`Error::Conflict`];
    /// with `force` the holder is revoked and replaced in the same step.
    pub fn create(&self, config: Config, force: bool) -> Result<Session> {
        let now = self.clock.now();
        let resource_key = config.resource_key();
        let mut inner = self.inner.lock();
        self.sweep_locked(&mut inner, now);

        if let Some(holder) = inner.holders.get(&resource_key).cloned() {
            if !force {
                return Err(Error::Conflict { held_by: holder });
            }
            inner.remove(&holder);
            info!("session {holder} evicted from {resource_key} by forced create");
        }

        let session = Session {
            session_id: SessionId::generate(),
            resource_key: resource_key.clone(),
            created_at: now,
            last_access_at: now,
            config,
        };
        inner
            .holders
            .insert(resource_key.clone(), session.session_id.clone());
        inner
            .sessions
            .insert(session.session_id.clone(), session.clone());
        info!("session {} opened on {resource_key}", session.session_id);
        Ok(session)
    }

    /// Move an existing session to a new configuration.
    ///
    /// Claiming a resource held by another session follows the same rules as
    /// [`SessionRegistry::create`]. The previous resource is released.
    pub fn update(&self, id: &SessionId, config: Config, force: bool) -> Result<Rebind> {
        let now = self.clock.now();
        let new_key = config.resource_key();
        let mut inner = self.inner.lock();
        self.sweep_locked(&mut inner, now);

        let (old_key, previous) = match inner.sessions.get(id) {
            Some(session) => (session.resource_key.clone(), session.config.clone()),
            None => return Err(Error::Expired(format!("session {id}"))),
        };

        let mut evicted = None;
        if let Some(holder) = inner.holders.get(&new_key).cloned() {
            if &holder != id {
                if !force {
                    return Err(Error::Conflict { held_by: holder });
                }
                inner.remove(&holder);
                info!("session {holder} evicted from {new_key} by forced update of {id}");
                evicted = Some(holder);
            }
        }

        let released = if old_key != new_key {
            if inner.holders.get(&old_key) == Some(id) {
                inner.holders.remove(&old_key);
            }
            Some(old_key)
        } else {
            None
        };
        inner.holders.insert(new_key.clone(), id.clone());

        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| Error::Expired(format!("session {id}")))?;
        session.resource_key = new_key;
        session.config = config;
        session.last_access_at = now;
        Ok(Rebind {
            session: session.clone(),
            previous,
            released,
            evicted,
        })
    }

    /// Refresh the idle timer of a session.
    pub fn touch(&self, id: &SessionId) -> Result<()> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        match inner.sessions.get_mut(id) {
            Some(session) => {
                session.last_access_at = now;
                Ok(())
            }
            None => Err(Error::NotFound(format!("session {id}"))),
        }
    }

    /// Touch and return a live session. A session found idle past the timeout
    /// is removed on the spot.
    pub fn get(&self, id: &SessionId) -> Result<Session> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let idle = match inner.sessions.get(id) {
            Some(session) => is_idle(session, now, self.idle_timeout),
            None => return Err(Error::Expired(format!("session {id}"))),
        };
        if idle {
            inner.remove(id);
            info!("session {id} expired");
            return Err(Error::Expired(format!("session {id}")));
        }
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| Error::Expired(format!("session {id}")))?;
        session.last_access_at = now;
        Ok(session.clone())
    }

    /// Remove a session, returning it if it was live. Calling it again is harmless.
    pub fn revoke(&self, id: &SessionId) -> Option<Session> {
        let removed = self.inner.lock().remove(id);
        if let Some(session) = &removed {
            info!("session {id} released {}", session.resource_key);
        }
        removed
    }

    /// Remove every session idle for longer than the timeout at `now`.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<SessionId> {
        let mut inner = self.inner.lock();
        self.sweep_locked(&mut inner, now)
    }

    fn sweep_locked(&self, inner: &mut Inner, now: DateTime<Utc>) -> Vec<SessionId> {
        let expired = inner.expired_ids(now, self.idle_timeout);
        for id in &expired {
            inner.remove(id);
        }
        if !expired.is_empty() {
            info!("swept {} idle session(s)", expired.len());
        }
        expired
    }

    /// Live sessions, oldest first.
    pub fn list(&self) -> Vec<Session> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.sweep_locked(&mut inner, now);
        let mut sessions: Vec<Session> = inner.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| {
            (a.created_at, &a.session_id).cmp(&(b.created_at, &b.session_id))
        });
        sessions
    }

    /// A session by id without renewing its lease.
    pub fn lookup(&self, id: &SessionId) -> Option<Session> {
        self.inner.lock().sessions.get(id).cloned()
    }

    pub fn find(&self, key: &ResourceKey) -> Option<Session> {
        let inner = self.inner.lock();
        let holder = inner.holders.get(key)?;
        inner.sessions.get(holder).cloned()
    }

    /// Whether any session still holds `key`.
    pub fn is_held(&self, key: &ResourceKey) -> bool {
        self.inner.lock().holders.contains_key(key)
    }
}
