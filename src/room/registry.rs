#![forbid(unsafe_code)]

// Room registry - process-wide map from room id to room.
//
// The outer map lock is held only to find or insert a room's once-cell; the
// router is created inside the cell so concurrent joins of an unseen room
// create exactly one router, and unrelated rooms never wait on each other.

use super::Room;
use crate::error::SessionResult;
use crate::events::{EventBus, RoomEvent};
use crate::media::{EngineStatus, MediaEngine, MediaError, RtpCodecCapability};
use crate::metrics::{Counter, ServerMetrics};
use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const REBUILD_BACKOFF_START: Duration = Duration::from_secs(1);
const REBUILD_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// What happens to a room once its last peer leaves
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RoomRetention {
    /// Keep the room and its router until removed explicitly
    #[default]
    Retain,
    ReleaseWhenEmpty,
}

impl FromStr for RoomRetention {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "retain" => Ok(RoomRetention::Retain),
            "release-when-empty" | "release" => Ok(RoomRetention::ReleaseWhenEmpty),
            other => Err(format!("unknown room retention policy: {other}")),
        }
    }
}

type RoomCell = Arc<OnceCell<Arc<Room>>>;

pub struct RoomRegistry {
    engine: StdRwLock<Arc<dyn MediaEngine>>,
    /// Reason of the last engine failure while no replacement is installed
    failure: StdRwLock<Option<String>>,
    rooms: StdRwLock<HashMap<String, RoomCell>>,
    codecs: Vec<RtpCodecCapability>,
    retention: RoomRetention,
    events: EventBus,
    metrics: ServerMetrics,
}

impl RoomRegistry {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        codecs: Vec<RtpCodecCapability>,
        retention: RoomRetention,
        events: EventBus,
        metrics: ServerMetrics,
    ) -> Self {
        Self {
            engine: StdRwLock::new(engine),
            failure: StdRwLock::new(None),
            rooms: StdRwLock::new(HashMap::new()),
            codecs,
            retention,
            events,
            metrics,
        }
    }

    pub fn retention(&self) -> RoomRetention {
        self.retention
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn engine(&self) -> Arc<dyn MediaEngine> {
        self.engine.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// The current engine, unless it died and nothing replaced it yet
    pub fn ensure_available(&self) -> SessionResult<Arc<dyn MediaEngine>> {
        if let Some(reason) = self.failure.read().unwrap_or_else(|e| e.into_inner()).as_ref() {
            return Err(MediaError::WorkerDied(reason.clone()).into());
        }
        let engine = self.engine();
        let status = engine.status().borrow().clone();
        match status {
            EngineStatus::Running => Ok(engine),
            EngineStatus::Failed { reason } => Err(MediaError::WorkerDied(reason).into()),
        }
    }

    pub fn is_available(&self) -> bool {
        self.ensure_available().is_ok()
    }

    fn cell(&self, room_id: &str) -> RoomCell {
        {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            if let Some(cell) = rooms.get(room_id) {
                return cell.clone();
            }
        }
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        rooms.entry(room_id.to_string()).or_default().clone()
    }

    /// Drops the map entry only if it still holds this very cell
    fn forget(&self, room_id: &str, cell: &RoomCell) {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        if rooms.get(room_id).is_some_and(|current| Arc::ptr_eq(current, cell)) {
            rooms.remove(room_id);
        }
    }

    /// Returns the room, creating it and its router on first use
    pub async fn get_or_create(&self, room_id: &str) -> SessionResult<Arc<Room>> {
        loop {
            let engine = self.ensure_available()?;
            let cell = self.cell(room_id);

            let created = cell
                .get_or_try_init(|| async move {
                    let router = engine.create_router(&self.codecs).await?;
                    info!("Created room {} with router {}", room_id, router.id());
                    self.metrics.inc(Counter::RoomsCreated);
                    self.events.publish(RoomEvent::RoomCreated {
                        room_id: room_id.to_string(),
                    });
                    Ok::<_, MediaError>(Arc::new(Room::new(
                        room_id.to_string(),
                        router,
                        self.events.clone(),
                    )))
                })
                .await;

            match created {
                Ok(room) if room.is_retired() => {
                    // Lost a race with release; the next pass creates a fresh room
                    self.forget(room_id, &cell);
                }
                Ok(room) => return Ok(room.clone()),
                Err(e) => {
                    warn!("Failed to create room {}: {}", room_id, e);
                    self.forget(room_id, &cell);
                    return Err(e.into());
                }
            }
        }
    }

    pub fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.get(room_id).and_then(|cell| cell.get().cloned())
    }

    /// Retires a room, closes its router and forgets it
    pub fn remove(&self, room_id: &str) -> bool {
        let cell = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms.remove(room_id)
        };
        match cell.and_then(|cell| cell.get().cloned()) {
            Some(room) => {
                room.retire("room removed");
                self.released(room_id);
                true
            }
            None => false,
        }
    }

    /// Applies the retention policy after a peer left `room`
    pub fn release_if_empty(&self, room: &Arc<Room>) -> bool {
        if self.retention != RoomRetention::ReleaseWhenEmpty || !room.retire_if_empty() {
            return false;
        }
        {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            let same = rooms
                .get(room.id())
                .and_then(|cell| cell.get())
                .is_some_and(|current| Arc::ptr_eq(current, room));
            if same {
                rooms.remove(room.id());
            }
        }
        self.released(room.id());
        true
    }

    fn released(&self, room_id: &str) {
        info!("Released room {}", room_id);
        self.metrics.inc(Counter::RoomsReleased);
        self.events.publish(RoomEvent::RoomReleased {
            room_id: room_id.to_string(),
        });
    }

    /// Engine-wide failure. Every room is failed and dropped and joins are
    /// refused until [`install_engine`](Self::install_engine).
    pub fn fail_all(&self, reason: &str) {
        {
            let mut failure = self.failure.write().unwrap_or_else(|e| e.into_inner());
            if failure.is_some() {
                return;
            }
            *failure = Some(reason.to_string());
        }

        let cells: Vec<RoomCell> = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms.drain().map(|(_, cell)| cell).collect()
        };

        let mut peers = 0;
        let mut rooms = 0;
        for room in cells.iter().filter_map(|cell| cell.get()) {
            peers += room.fail(reason);
            rooms += 1;
        }

        error!(
            "Media engine failed ({}): {} rooms and {} peers torn down",
            reason, rooms, peers
        );
        self.metrics.inc(Counter::EngineFailures);
        self.events.publish(RoomEvent::EngineFailed {
            reason: reason.to_string(),
        });
    }

    /// Swaps in a fresh engine and accepts joins again
    pub fn install_engine(&self, engine: Arc<dyn MediaEngine>) {
        info!("Installing media engine ({})", engine.name());
        *self.engine.write().unwrap_or_else(|e| e.into_inner()) = engine;
        *self.failure.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Watches the engine and, once it dies, fails every room and rebuilds a
    /// replacement with exponential backoff. Runs until the task is aborted.
    pub fn supervise<F, Fut>(self: Arc<Self>, rebuild: F) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Arc<dyn MediaEngine>>> + Send,
    {
        tokio::spawn(async move {
            loop {
                let mut status = self.engine().status();
                let reason = loop {
                    if let EngineStatus::Failed { reason } = &*status.borrow_and_update() {
                        break reason.clone();
                    }
                    if status.changed().await.is_err() {
                        break "engine status channel closed".to_string();
                    }
                };

                self.fail_all(&reason);

                let mut backoff = REBUILD_BACKOFF_START;
                loop {
                    match rebuild().await {
                        Ok(engine) => {
                            self.install_engine(engine);
                            break;
                        }
                        Err(e) => {
                            error!("Failed to rebuild media engine: {:#}, retrying in {:?}", e, backoff);
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(REBUILD_BACKOFF_MAX);
                        }
                    }
                }
            }
        })
    }

    pub fn room_count(&self) -> usize {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.values().filter(|cell| cell.initialized()).count()
    }

    pub fn peer_count(&self) -> usize {
        let rooms: Vec<Arc<Room>> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.values().filter_map(|cell| cell.get().cloned()).collect()
        };
        rooms.iter().map(|room| room.peer_count()).sum()
    }

    /// Closes every room on shutdown
    pub fn shutdown(&self) {
        let cells: Vec<(String, RoomCell)> = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms.drain().collect()
        };
        for (room_id, cell) in &cells {
            if let Some(room) = cell.get() {
                room.retire("server shutting down");
                info!("Shut down room {}", room_id);
            }
        }
        info!("All rooms shut down ({} total)", cells.len());
    }
}
