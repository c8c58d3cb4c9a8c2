//! Client permission gate: advisory checks in front of UI and mutations.
//!
//! DESIGN
//! ======
//! Permissions are fetched per room from `GET /rooms/{id}/permissions` and
//! cached with a TTL. A stale entry keeps answering while a revalidation is
//! in flight, so a long session does not flicker to "loading" every TTL.
//! Anything unresolved or failed answers "no" from [`PermissionGate::allows`].
//!
//! The gate never enforces anything. The server re-checks every write; the
//! gate only keeps a client from emitting writes it already knows are
//! doomed, and from showing controls that would produce them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ClientConfig, ClientError};
use crate::services::permission::{CanvasPermission, Permission};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// SOURCE
// =============================================================================

/// Where resolved permissions come from.
#[async_trait]
pub trait PermissionSource: Send + Sync {
    async fn fetch(&self, room_id: Uuid) -> Result<CanvasPermission, ClientError>;
}

/// Fetches permissions from the room directory over HTTP.
pub struct HttpPermissionSource {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpPermissionSource {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self { http, base_url: config.base_url.trim_end_matches('/').to_owned(), token: config.token.clone() })
    }
}

#[async_trait]
impl PermissionSource for HttpPermissionSource {
    async fn fetch(&self, room_id: Uuid) -> Result<CanvasPermission, ClientError> {
        let url = format!("{}/rooms/{room_id}/permissions", self.base_url);
        let permissions = self
            .http
            .get(&url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .send()
            .await?
            .error_for_status()?
            .json::<CanvasPermission>()
            .await?;
        Ok(permissions)
    }
}

// =============================================================================
// GATE
// =============================================================================

/// What a gated piece of UI should show right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Loading,
    Allowed,
    Denied,
    Failed,
}

#[derive(Debug, Clone, Copy)]
enum Entry {
    Resolved { permissions: CanvasPermission, fetched_at: Instant },
    Failed,
}

#[derive(Default)]
struct Cache {
    entries: HashMap<Uuid, Entry>,
    /// Last fetch attempt per room; background retries wait a full TTL.
    attempts: HashMap<Uuid, Instant>,
    refreshing: Vec<Uuid>,
}

pub struct PermissionGate {
    source: Arc<dyn PermissionSource>,
    ttl: Duration,
    cache: Mutex<Cache>,
}

impl PermissionGate {
    #[must_use]
    pub fn new(source: Arc<dyn PermissionSource>, ttl: Duration) -> Self {
        Self { source, ttl, cache: Mutex::new(Cache::default()) }
    }

    fn lock(&self) -> MutexGuard<'_, Cache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Last resolved permissions for the room, stale or not.
    #[must_use]
    pub fn permissions(&self, room_id: Uuid) -> Option<CanvasPermission> {
        match self.lock().entries.get(&room_id) {
            Some(Entry::Resolved { permissions, .. }) => Some(*permissions),
            _ => None,
        }
    }

    #[must_use]
    pub fn state(&self, room_id: Uuid, permission: Permission) -> GateState {
        match self.lock().entries.get(&room_id) {
            None => GateState::Loading,
            Some(Entry::Failed) => GateState::Failed,
            Some(Entry::Resolved { permissions, .. }) if permissions.allows(permission) => GateState::Allowed,
            Some(Entry::Resolved { .. }) => GateState::Denied,
        }
    }

    /// Pick exactly one of `children`, `fallback` or `loading`.
    pub fn render<T>(&self, room_id: Uuid, permission: Permission, children: T, fallback: T, loading: T) -> T {
        match self.state(room_id, permission) {
            GateState::Allowed => children,
            GateState::Denied | GateState::Failed => fallback,
            GateState::Loading => loading,
        }
    }

    /// Synchronous guard for imperative mutations. Default-deny.
    #[must_use]
    pub fn allows(&self, room_id: Uuid, permission: Permission) -> bool {
        self.state(room_id, permission) == GateState::Allowed
    }

    #[must_use]
    pub fn is_stale(&self, room_id: Uuid) -> bool {
        match self.lock().entries.get(&room_id) {
            Some(Entry::Resolved { fetched_at, .. }) => fetched_at.elapsed() >= self.ttl,
            _ => true,
        }
    }

    /// Record permissions learned elsewhere, e.g. from a join snapshot.
    pub fn set(&self, room_id: Uuid, permissions: CanvasPermission) {
        self.lock().entries.insert(room_id, Entry::Resolved { permissions, fetched_at: Instant::now() });
    }

    /// Forget the room so the next check shows loading and refetches.
    pub fn invalidate(&self, room_id: Uuid) {
        let mut cache = self.lock();
        cache.entries.remove(&room_id);
        cache.attempts.remove(&room_id);
    }

    /// Fetch now and cache the outcome. A failure is cached as `Failed`
    /// unless an earlier value exists, which is kept.
    pub async fn refresh(&self, room_id: Uuid) -> GateState {
        self.lock().attempts.insert(room_id, Instant::now());
        match self.source.fetch(room_id).await {
            Ok(permissions) => {
                debug!(%room_id, ?permissions, "gate: permissions resolved");
                self.set(room_id, permissions);
            }
            Err(e) => {
                warn!(%room_id, error = %e, "gate: permission fetch failed");
                self.lock().entries.entry(room_id).or_insert(Entry::Failed);
            }
        }
        self.state(room_id, Permission::View)
    }

    /// Fetch only when nothing fresh is cached.
    pub async fn prime(&self, room_id: Uuid) {
        if self.is_stale(room_id) {
            self.refresh(room_id).await;
        }
    }

    /// Start a background refresh for a stale room unless one is running.
    pub fn revalidate_if_stale(self: &Arc<Self>, room_id: Uuid) {
        if !self.is_stale(room_id) {
            return;
        }
        {
            let mut cache = self.lock();
            let recently_tried = cache.attempts.get(&room_id).is_some_and(|at| at.elapsed() < self.ttl);
            if recently_tried || cache.refreshing.contains(&room_id) {
                return;
            }
            cache.refreshing.push(room_id);
        }

        let gate = Arc::clone(self);
        tokio::spawn(async move {
            gate.refresh(room_id).await;
            gate.lock().refreshing.retain(|id| *id != room_id);
        });
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{StaticPermissions, editor, viewer};
    use super::*;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn unresolved_room_is_loading_and_denied() {
        let gate = PermissionGate::new(StaticPermissions::new(Some(editor())), Duration::from_secs(30));
        let room = Uuid::new_v4();
        assert_eq!(gate.state(room, Permission::Edit), GateState::Loading);
        assert!(!gate.allows(room, Permission::View));
        assert_eq!(gate.render(room, Permission::Edit, "canvas", "denied", "spinner"), "spinner");
    }

    #[tokio::test]
    async fn resolved_permissions_drive_render_and_allows() {
        let gate = PermissionGate::new(StaticPermissions::new(Some(viewer())), Duration::from_secs(30));
        let room = Uuid::new_v4();
        assert_eq!(gate.refresh(room).await, GateState::Allowed);

        assert_eq!(gate.render(room, Permission::View, "canvas", "denied", "spinner"), "canvas");
        assert_eq!(gate.render(room, Permission::Edit, "toolbar", "read-only", "spinner"), "read-only");
        assert!(gate.allows(room, Permission::View));
        assert!(!gate.allows(room, Permission::Edit));
    }

    #[tokio::test]
    async fn fetch_failure_renders_fallback() {
        let gate = PermissionGate::new(StaticPermissions::new(None), Duration::from_secs(30));
        let room = Uuid::new_v4();
        assert_eq!(gate.refresh(room).await, GateState::Failed);
        assert_eq!(gate.render(room, Permission::View, 1, 2, 3), 2);
        assert!(!gate.allows(room, Permission::View));
    }

    #[tokio::test]
    async fn failed_revalidation_keeps_last_answer() {
        let source = StaticPermissions::new(Some(editor()));
        let gate = PermissionGate::new(source.clone(), Duration::from_secs(30));
        let room = Uuid::new_v4();
        gate.refresh(room).await;

        source.set(None);
        gate.refresh(room).await;
        assert!(gate.allows(room, Permission::Edit));
    }

    #[tokio::test]
    async fn prime_fetches_once_within_ttl() {
        let source = StaticPermissions::new(Some(editor()));
        let gate = PermissionGate::new(source.clone(), Duration::from_secs(30));
        let room = Uuid::new_v4();
        gate.prime(room).await;
        gate.prime(room).await;
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_ttl_is_always_stale() {
        let source = StaticPermissions::new(Some(editor()));
        let gate = PermissionGate::new(source.clone(), Duration::ZERO);
        let room = Uuid::new_v4();
        gate.prime(room).await;
        assert!(gate.is_stale(room));
        gate.prime(room).await;
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_returns_to_loading() {
        let gate = PermissionGate::new(StaticPermissions::new(Some(editor())), Duration::from_secs(30));
        let room = Uuid::new_v4();
        gate.set(room, editor());
        gate.invalidate(room);
        assert_eq!(gate.state(room, Permission::Edit), GateState::Loading);
    }

    #[tokio::test]
    async fn background_revalidation_picks_up_revocation() {
        let source = StaticPermissions::new(Some(editor()));
        let gate = Arc::new(PermissionGate::new(source.clone(), Duration::ZERO));
        let room = Uuid::new_v4();
        gate.refresh(room).await;
        assert!(gate.allows(room, Permission::Edit));

        source.set(Some(viewer()));
        gate.revalidate_if_stale(room);
        tokio::time::timeout(Duration::from_millis(200), async {
            while gate.allows(room, Permission::Edit) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("revalidation did not land");
    }
}
