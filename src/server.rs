//! Process-level runtime: the TCP listener, the room-hub registry and the
//! background sweepers for presence TTLs and room expiry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthProvider, StaticTokenAuth};
use crate::config::{Config, Limits, Ttls};
use crate::protocol::ErrorKind;
use crate::room::{RoomHub, RoomHubHandle, RoomMessage};
use crate::session::{self, SessionContext};
use crate::store::{MemoryStore, Store, StoreError, StoreHandle};
use crate::types::{Presence, RoomId, RoomStatus};

const PRESENCE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const ROOM_EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Get-or-start access to room hubs. Hubs stop themselves when idle; a dead
/// handle is replaced on next use, which is also how a hub whose task
/// panicked comes back.
#[derive(Clone)]
pub struct RoomDirectory {
    store: StoreHandle,
    limits: Limits,
    ttls: Ttls,
    hubs: Arc<Mutex<HashMap<RoomId, RoomHubHandle>>>,
}

impl RoomDirectory {
    pub fn new(store: StoreHandle, limits: Limits, ttls: Ttls) -> Self {
        Self {
            store,
            limits,
            ttls,
            hubs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn hub(&self, room_id: &RoomId) -> Result<RoomHubHandle, ErrorKind> {
        let mut hubs = self.hubs.lock().await;
        if let Some(handle) = hubs.get(room_id) {
            if handle.is_alive() {
                return Ok(handle.clone());
            }
            hubs.remove(room_id);
        }
        let room = self.store.room(room_id).await.map_err(|error| match error {
            StoreError::NotFound(what) => ErrorKind::NotFound(what),
            _ => ErrorKind::Unavailable,
        })?;
        if room.status != RoomStatus::Active {
            return Err(ErrorKind::PermissionDenied);
        }
        let handle = RoomHub::spawn(
            room,
            self.store.clone(),
            self.limits.clone(),
            self.ttls.clone(),
        );
        hubs.insert(room_id.clone(), handle.clone());
        Ok(handle)
    }

    /// Forwards swept presence rows to the hubs of their rooms, so peers
    /// hear about participants going offline. Rooms without a live hub have
    /// nobody to tell.
    async fn broadcast_presence_sweep(&self, swept: Vec<Presence>) {
        let hubs = self.hubs.lock().await;
        for presence in swept {
            if let Some(handle) = hubs.get(&presence.room_id) {
                if handle.is_alive() {
                    let _ = handle.send(RoomMessage::PresenceSwept { presence }).await;
                }
            }
        }
    }

    async fn shutdown_room(&self, room_id: &RoomId) {
        let mut hubs = self.hubs.lock().await;
        if let Some(handle) = hubs.remove(room_id) {
            let _ = handle.send(RoomMessage::Shutdown).await;
        }
    }

    async fn prune_dead_hubs(&self) {
        let mut hubs = self.hubs.lock().await;
        hubs.retain(|_, handle| handle.is_alive());
    }
}

pub struct Server {
    config: Config,
    store: StoreHandle,
    auth: Arc<dyn AuthProvider>,
    rooms: RoomDirectory,
}

impl Server {
    pub fn new(config: Config, store: Arc<dyn Store>, auth: Arc<dyn AuthProvider>) -> Self {
        let store = StoreHandle::new(store, config.ttls.store_deadline);
        let rooms = RoomDirectory::new(
            store.clone(),
            config.limits.clone(),
            config.ttls.clone(),
        );
        Self {
            config,
            store,
            auth,
            rooms,
        }
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn rooms(&self) -> &RoomDirectory {
        &self.rooms
    }

    pub fn session_context(&self) -> SessionContext {
        SessionContext {
            auth: self.auth.clone(),
            rooms: self.rooms.clone(),
            limits: self.config.limits.clone(),
            ttls: self.config.ttls.clone(),
        }
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let address = self.config.bind_address();
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("failed to bind {address}"))?;
        info!("listening on {}", listener.local_addr()?);
        if !self.config.allowed_origins.is_empty() {
            debug!(origins = ?self.config.allowed_origins, "origins allowed for the HTTP layer");
        }
        Ok(listener)
    }

    /// Accepts connections until the task is dropped.
    pub async fn listen(&self, listener: TcpListener) {
        self.spawn_sweepers();
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    tokio::spawn(session::run(stream, self.session_context()));
                }
                Err(error) => {
                    error!(%error, "error accepting connection");
                }
            }
        }
    }

    fn spawn_sweepers(&self) {
        let store = self.store.clone();
        let rooms = self.rooms.clone();
        let presence_ttl = self.config.ttls.presence;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(PRESENCE_SWEEP_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                let threshold = OffsetDateTime::now_utc() - presence_ttl;
                match store.sweep_presence(threshold).await {
                    Ok(swept) if !swept.is_empty() => {
                        debug!(count = swept.len(), "marked stale presence offline");
                        rooms.broadcast_presence_sweep(swept).await;
                    }
                    Ok(_) => {}
                    Err(error) => warn!(%error, "presence sweep failed"),
                }
                rooms.prune_dead_hubs().await;
            }
        });

        let store = self.store.clone();
        let rooms = self.rooms.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(ROOM_EXPIRY_SWEEP_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                match store.expire_rooms(OffsetDateTime::now_utc()).await {
                    Ok(expired) => {
                        for room_id in expired {
                            info!(room = %room_id, "room expired");
                            rooms.shutdown_room(&room_id).await;
                        }
                    }
                    Err(error) => warn!(%error, "room expiry sweep failed"),
                }
            }
        });
    }
}

/// Builds the store the configuration points at. Only the in-process store
/// can be constructed here; anything else must be reachable, which for this
/// build means it is not.
pub fn build_store(config: &Config) -> Result<Arc<dyn Store>, StoreError> {
    if config.uses_memory_store() {
        Ok(MemoryStore::shared())
    } else {
        Err(StoreError::Unavailable(format!(
            "no driver for store scheme {:?}",
            config.store_url.scheme()
        )))
    }
}

pub fn build_auth(config: &Config) -> Arc<dyn AuthProvider> {
    Arc::new(StaticTokenAuth::new(config.tokens.clone()))
}
