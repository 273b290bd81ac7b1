//! Sessions and their registry.
//!
//! A [`Session`] is identified twice: by a numeric HID and by an
//! opaque SID string. The [`SessionManager`] keeps three indexes (by
//! HID, by SID, and the full set) behind separate mutexes, always
//! taken one at a time in that order. Debounce timers are tokio tasks
//! holding weak handles, resolved against the registry when they fire,
//! so a dead session can never be kept alive by its own timers.

use crate::mechanics::{CounterContainer, GeneratorContainer, LimitContainer};
use crate::Result;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub type Hid = u64;
pub type Sid = String;

/// Debounce before an idle session is unloaded.
pub const UNLOAD_DELAY: Duration = Duration::from_secs(300);
/// Debounce before changed state is saved.
pub const SAVE_DELAY: Duration = Duration::from_secs(5);

/// A per-player state container.
#[derive(Debug)]
pub struct Session {
    pub hid: Hid,
    sid: Mutex<Sid>,
    ready: AtomicBool,

    counters: Mutex<CounterContainer>,
    limits: Mutex<LimitContainer>,
    generators: Mutex<GeneratorContainer>,

    save_timer: Mutex<Option<JoinHandle<()>>>,
    unload_timer: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub fn new(hid: Hid) -> Arc<Session> {
        Arc::new(Session {
            hid,
            sid: Mutex::new(Sid::new()),
            ready: AtomicBool::new(false),
            counters: Mutex::new(CounterContainer::new()),
            limits: Mutex::new(LimitContainer::new()),
            generators: Mutex::new(GeneratorContainer::new()),
            save_timer: Mutex::new(None),
            unload_timer: Mutex::new(None),
        })
    }

    pub fn sid(&self) -> Sid {
        self.sid.lock().unwrap().clone()
    }

    pub(crate) fn set_sid(&self, sid: Sid) {
        *self.sid.lock().unwrap() = sid;
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// The session's counters; don't hold the guard across awaits.
    pub fn counters(&self) -> MutexGuard<'_, CounterContainer> {
        self.counters.lock().unwrap()
    }

    pub fn limits(&self) -> MutexGuard<'_, LimitContainer> {
        self.limits.lock().unwrap()
    }

    pub fn generators(&self) -> MutexGuard<'_, GeneratorContainer> {
        self.generators.lock().unwrap()
    }

    /// Any container with unsaved changes?
    pub fn is_changed(&self) -> bool {
        self.counters().is_changed() || self.limits().is_changed() || self.generators().is_changed()
    }

    /// Load persisted state. The base session has nothing to load
    /// from; concrete persistence lives outside the core.
    pub fn load(&self) -> Result<bool> {
        Ok(false)
    }

    /// Save changed state. See [`Session::load`].
    pub fn save(&self) -> Result<bool> {
        Ok(false)
    }

    fn cancel_timers(&self) {
        if let Some(timer) = self.save_timer.lock().unwrap().take() {
            timer.abort();
        }
        if let Some(timer) = self.unload_timer.lock().unwrap().take() {
            timer.abort();
        }
    }
}

/// Registry of live sessions.
#[derive(Debug)]
pub struct SessionManager {
    // Lock order: by_hid, then by_sid, then sessions; never two at
    // once unless in that order.
    by_hid: Mutex<HashMap<Hid, Weak<Session>>>,
    by_sid: Mutex<HashMap<Sid, Weak<Session>>>,
    sessions: Mutex<HashMap<Hid, Arc<Session>>>,

    unload_delay: Duration,
    save_delay: Duration,

    /// Handed to timers so they never keep the manager alive.
    weak_self: Weak<SessionManager>,
}

impl SessionManager {
    pub fn new() -> Arc<SessionManager> {
        SessionManager::with_delays(UNLOAD_DELAY, SAVE_DELAY)
    }

    pub fn with_delays(unload_delay: Duration, save_delay: Duration) -> Arc<SessionManager> {
        Arc::new_cyclic(|weak| SessionManager {
            by_hid: Mutex::new(HashMap::new()),
            by_sid: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            unload_delay,
            save_delay,
            weak_self: weak.clone(),
        })
    }

    /// A fresh random SID.
    pub fn generate_sid() -> Sid {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect()
    }

    /// Register `sid` for the session.
    ///
    /// An empty `sid` just unregisters the old one. Returns `false`
    /// when the SID is already taken by another session.
    pub fn reg_sid(&self, session: &Arc<Session>, sid: Sid) -> bool {
        let mut by_sid = self.by_sid.lock().unwrap();
        if let Some(existing) = by_sid.get(&sid) {
            if existing.upgrade().is_some() {
                return false;
            }
        }

        let old = session.sid();
        if !old.is_empty() {
            by_sid.remove(&old);
        }
        if sid.is_empty() {
            session.set_sid(sid);
            return true;
        }
        session.set_sid(sid.clone());
        by_sid.insert(sid, Arc::downgrade(session));
        true
    }

    pub fn session_by_sid(&self, sid: &str) -> Option<Arc<Session>> {
        let mut by_sid = self.by_sid.lock().unwrap();
        let weak = by_sid.get(sid)?;
        match weak.upgrade() {
            Some(session) if session.sid() == sid => Some(session),
            // Stale entry: the session died or moved to another SID.
            _ => {
                by_sid.remove(sid);
                None
            }
        }
    }

    pub fn session_by_hid(&self, hid: Hid) -> Option<Arc<Session>> {
        let mut by_hid = self.by_hid.lock().unwrap();
        match by_hid.get(&hid).and_then(Weak::upgrade) {
            Some(session) => Some(session),
            None => {
                by_hid.remove(&hid);
                None
            }
        }
    }

    /// Register a session under `hid` and arm its unload timer.
    ///
    /// An existing live session under the same HID wins and is
    /// refreshed instead. A session that is not ready is refused.
    pub fn put_session(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let hid = session.hid;

        if let Some(existing) = self.session_by_hid(hid) {
            self.touch(&existing);
            return Some(existing);
        }

        if !session.is_ready() {
            return None;
        }

        self.by_hid
            .lock()
            .unwrap()
            .insert(hid, Arc::downgrade(&session));
        self.sessions.lock().unwrap().insert(hid, session.clone());

        let sid = session.sid();
        if !sid.is_empty() {
            self.by_sid
                .lock()
                .unwrap()
                .insert(sid, Arc::downgrade(&session));
        }

        self.touch(&session);
        debug!(hid, "session registered");
        Some(session)
    }

    /// Re-arm the unload debounce.
    ///
    /// The timer holds a weak manager handle; on fire it resolves the
    /// registry and closes the session with reason `timeout`.
    pub fn touch(&self, session: &Arc<Session>) {
        let weak = self.weak_self.clone();
        let hid = session.hid;
        let delay = self.unload_delay;

        let mut timer = session.unload_timer.lock().unwrap();
        if let Some(old) = timer.take() {
            old.abort();
        }
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = weak.upgrade() {
                manager.close_session(hid, "timeout");
            }
        }));
    }

    /// Arm the save debounce, once; further changes before it fires
    /// ride along.
    pub fn changed(&self, session: &Arc<Session>) {
        let mut timer = session.save_timer.lock().unwrap();
        if timer.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let weak = Arc::downgrade(session);
        let delay = self.save_delay;
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(session) = weak.upgrade() {
                if session.is_changed() {
                    let _ = session.save();
                    session.counters().mark_saved();
                    session.limits().mark_saved();
                    session.generators().mark_saved();
                }
            }
        }));
    }

    /// Unregister and drop a session.
    pub fn close_session(&self, hid: Hid, reason: &str) {
        let session = self.sessions.lock().unwrap().remove(&hid);
        let Some(session) = session else { return };

        info!(hid, reason, "session closed");
        session.cancel_timers();

        self.by_hid.lock().unwrap().remove(&hid);
        let sid = session.sid();
        if !sid.is_empty() {
            self.by_sid.lock().unwrap().remove(&sid);
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Visit every live session.
    pub fn for_each(&self, mut visit: impl FnMut(&Arc<Session>)) {
        let sessions: Vec<_> = self.sessions.lock().unwrap().values().cloned().collect();
        for session in sessions {
            visit(&session);
        }
    }
}
