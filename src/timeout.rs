//! Owns all deadline timers on behalf of sessions and delivers a single
//! callback when a deadline expires, guaranteeing that a cancelled timer
//! produces no further notification. Grounded on the original timeout
//! manager (`timeout_manager.hpp`/`.cpp`): the remove-from-map-before-
//! invoking-callback ordering there is the one invariant this module must
//! preserve exactly, since it is what prevents deadlock if the callback
//! itself starts a new timer.
//!
//! tokio has no direct equivalent of `boost::asio::steady_timer::cancel()`
//! delivering an `operation_aborted` error to the waiter, so cancellation
//! is modeled with a generation counter per record: the spawned fire task
//! captures the generation it was started with, and after waking from
//! `sleep` it must find that exact generation still present in the map
//! before it is allowed to remove the record and invoke the callback. A
//! `JoinHandle::abort()` on replacement/cancellation additionally stops
//! the task outright in the common case; the generation check is the
//! fallback that makes correctness independent of abort's exact timing.

use crate::monitor::{PerformanceMonitor, TimeoutKind};
use crate::session::{PooledSession, SessionId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub type TimeoutCallback = Arc<dyn Fn(Arc<PooledSession>, TimeoutKind) + Send + Sync>;

struct TimerRecord {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct TimerMaps {
    connection: HashMap<SessionId, TimerRecord>,
    request: HashMap<SessionId, TimerRecord>,
    next_generation: u64,
}

impl TimerMaps {
    fn map_for(&mut self, kind: TimeoutKind) -> &mut HashMap<SessionId, TimerRecord> {
        match kind {
            TimeoutKind::Connection => &mut self.connection,
            TimeoutKind::Request => &mut self.request,
        }
    }
}

pub struct TimeoutManager {
    maps: Arc<AsyncMutex<TimerMaps>>,
    connection_timeout: RwLock<Duration>,
    request_timeout: RwLock<Duration>,
    default_callback: RwLock<TimeoutCallback>,
    monitor: Arc<PerformanceMonitor>,
}

impl TimeoutManager {
    pub fn new(
        connection_timeout: Duration,
        request_timeout: Duration,
        monitor: Arc<PerformanceMonitor>,
    ) -> Arc<Self> {
        let default_callback: TimeoutCallback = {
            let monitor = monitor.clone();
            Arc::new(move |session: Arc<PooledSession>, kind: TimeoutKind| {
                monitor.record_timeout(kind);
                warn!(?kind, "default timeout handler firing");
                session.handle_timeout(kind);
            })
        };

        Arc::new(Self {
            maps: Arc::new(AsyncMutex::new(TimerMaps::default())),
            connection_timeout: RwLock::new(connection_timeout),
            request_timeout: RwLock::new(request_timeout),
            default_callback: RwLock::new(default_callback),
            monitor,
        })
    }

    pub async fn start_connection_timeout(
        self: &Arc<Self>,
        session: Option<Arc<PooledSession>>,
        callback: Option<TimeoutCallback>,
        duration: Option<Duration>,
    ) {
        self.start_timeout(TimeoutKind::Connection, session, callback, duration)
            .await;
    }

    pub async fn start_request_timeout(
        self: &Arc<Self>,
        session: Option<Arc<PooledSession>>,
        callback: Option<TimeoutCallback>,
        duration: Option<Duration>,
    ) {
        self.start_timeout(TimeoutKind::Request, session, callback, duration)
            .await;
    }

    async fn start_timeout(
        self: &Arc<Self>,
        kind: TimeoutKind,
        session: Option<Arc<PooledSession>>,
        callback: Option<TimeoutCallback>,
        duration: Option<Duration>,
    ) {
        let Some(session) = session else {
            error!("start_timeout - null session provided");
            return;
        };

        let actual_duration = duration.unwrap_or(match kind {
            TimeoutKind::Connection => *self.connection_timeout.read().unwrap(),
            TimeoutKind::Request => *self.request_timeout.read().unwrap(),
        });
        let actual_callback = callback.unwrap_or_else(|| self.default_callback.read().unwrap().clone());

        let session_id = session.id();
        let mut maps = self.maps.lock().await;

        // Starting a timer of this kind cancels and replaces any existing one.
        if let Some(existing) = maps.map_for(kind).remove(&session_id) {
            debug!(?kind, session_id, "cancelling existing timer for replacement");
            existing.handle.abort();
        }

        let generation = maps.next_generation;
        maps.next_generation += 1;

        let maps_handle = self.maps.clone();
        let fire_session = session.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(actual_duration).await;

            let fired = {
                let mut maps = maps_handle.lock().await;
                let map = maps.map_for(kind);
                match map.get(&session_id) {
                    Some(record) if record.generation == generation => {
                        map.remove(&session_id);
                        true
                    }
                    _ => false,
                }
            };

            if !fired {
                debug!(?kind, session_id, "timer fire observed after cancellation, ignoring");
                return;
            }

            debug!(?kind, session_id, "timeout fired, invoking callback");
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                (actual_callback.as_ref())(fire_session.clone(), kind)
            }));
            if result.is_err() {
                error!(?kind, session_id, "panic in timeout callback, swallowed");
            }
        });

        maps.map_for(kind).insert(
            session_id,
            TimerRecord {
                generation,
                handle,
            },
        );
    }

    pub async fn cancel_timeouts(&self, session: Option<Arc<PooledSession>>) {
        let Some(session) = session else { return };
        let session_id = session.id();
        let mut maps = self.maps.lock().await;
        if let Some(existing) = maps.connection.remove(&session_id) {
            existing.handle.abort();
        }
        if let Some(existing) = maps.request.remove(&session_id) {
            existing.handle.abort();
        }
    }

    pub async fn cancel_connection_timeout(&self, session: Option<Arc<PooledSession>>) {
        self.cancel_one(TimeoutKind::Connection, session).await;
    }

    pub async fn cancel_request_timeout(&self, session: Option<Arc<PooledSession>>) {
        self.cancel_one(TimeoutKind::Request, session).await;
    }

    async fn cancel_one(&self, kind: TimeoutKind, session: Option<Arc<PooledSession>>) {
        let Some(session) = session else { return };
        let session_id = session.id();
        let mut maps = self.maps.lock().await;
        if let Some(existing) = maps.map_for(kind).remove(&session_id) {
            existing.handle.abort();
        }
    }

    /// Cancel every outstanding timer, used at shutdown.
    pub async fn cancel_all_timers(&self) {
        let mut maps = self.maps.lock().await;
        for (_, record) in maps.connection.drain() {
            record.handle.abort();
        }
        for (_, record) in maps.request.drain() {
            record.handle.abort();
        }
    }

    pub fn set_default_connection_timeout(&self, duration: Duration) {
        *self.connection_timeout.write().unwrap() = duration;
    }

    pub fn set_default_request_timeout(&self, duration: Duration) {
        *self.request_timeout.write().unwrap() = duration;
    }

    pub fn default_connection_timeout(&self) -> Duration {
        *self.connection_timeout.read().unwrap()
    }

    pub fn default_request_timeout(&self) -> Duration {
        *self.request_timeout.read().unwrap()
    }

    pub async fn active_connection_timer_count(&self) -> usize {
        self.maps.lock().await.connection.len()
    }

    pub async fn active_request_timer_count(&self) -> usize {
        self.maps.lock().await.request.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::make_test_session;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn cancelled_timer_never_fires() {
        let monitor = Arc::new(PerformanceMonitor::new());
        let manager = TimeoutManager::new(
            Duration::from_millis(50),
            Duration::from_secs(60),
            monitor,
        );
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let session = make_test_session().await;

        manager
            .start_connection_timeout(
                Some(session.clone()),
                Some(Arc::new(move |_s, _k| {
                    fired_clone.fetch_add(1, Ordering::SeqCst);
                })),
                Some(Duration::from_millis(50)),
            )
            .await;

        manager.cancel_connection_timeout(Some(session)).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn starting_a_new_timer_replaces_the_old_one() {
        let monitor = Arc::new(PerformanceMonitor::new());
        let manager = TimeoutManager::new(
            Duration::from_secs(60),
            Duration::from_secs(60),
            monitor,
        );
        let fired = Arc::new(AtomicUsize::new(0));
        let session = make_test_session().await;

        for _ in 0..3 {
            let fired_clone = fired.clone();
            manager
                .start_request_timeout(
                    Some(session.clone()),
                    Some(Arc::new(move |_s, _k| {
                        fired_clone.fetch_add(1, Ordering::SeqCst);
                    })),
                    Some(Duration::from_millis(50)),
                )
                .await;
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(manager.active_request_timer_count().await, 0);
    }

    #[tokio::test]
    async fn null_session_is_a_silent_no_op() {
        let monitor = Arc::new(PerformanceMonitor::new());
        let manager = TimeoutManager::new(
            Duration::from_secs(60),
            Duration::from_secs(60),
            monitor,
        );
        manager.start_connection_timeout(None, None, None).await;
        manager.cancel_timeouts(None).await;
        assert_eq!(manager.active_connection_timer_count().await, 0);
    }

    #[tokio::test]
    async fn cancel_all_timers_cancels_both_maps() {
        let monitor = Arc::new(PerformanceMonitor::new());
        let manager = TimeoutManager::new(
            Duration::from_secs(60),
            Duration::from_secs(60),
            monitor,
        );
        let session = make_test_session().await;
        manager
            .start_connection_timeout(Some(session.clone()), None, Some(Duration::from_secs(60)))
            .await;
        manager
            .start_request_timeout(Some(session.clone()), None, Some(Duration::from_secs(60)))
            .await;
        manager.cancel_all_timers().await;
        assert_eq!(manager.active_connection_timer_count().await, 0);
        assert_eq!(manager.active_request_timer_count().await, 0);
    }
}
