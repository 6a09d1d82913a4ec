use std::{
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
#[cfg(test)]
use mockall::automock;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
#[cfg(not(coverage_nightly))]
use tracing::{info, warn};

use crate::{
    browser::{BrowserEvent, BrowserHandle},
    droppable_handle::DroppableHandle,
};

const COUNTDOWN_TICK: Duration = Duration::from_secs(1);

pub(crate) const REASON_ALL_DISCONNECTED: &str = "All clients disconnected";
pub(crate) const REASON_FORCE_QUIT: &str = "Safe shutdown aborted, force quitting";
pub(crate) const REASON_COUNTDOWN_OVER: &str = "Countdown is over";

// Stops the listening transport once shutdown is final.
#[cfg_attr(test, automock)]
pub(crate) trait ShutdownHandler: Send + Sync {
    fn stop(&self, reason: &str);
}

// Cancels a token that the server loop is waiting on.
pub(crate) struct CancellationShutdown(pub(crate) CancellationToken);

impl ShutdownHandler for CancellationShutdown {
    fn stop(&self, reason: &str) {
        #[cfg(not(coverage_nightly))]
        info!(%reason, "Stopping server.");
        self.0.cancel();
    }
}

#[derive(Default)]
struct DrainState {
    draining: bool,
    remaining: u64,
    countdown: Option<DroppableHandle<()>>,
}

// Tracks live sessions and lets them finish before the process stops.
pub(crate) struct ShutdownCoordinator {
    sessions: DashMap<usize, BrowserHandle>,
    state: Mutex<DrainState>,
    finalized: AtomicBool,
    safe_shutdown_duration: u64,
    handler: Box<dyn ShutdownHandler>,
}

impl ShutdownCoordinator {
    pub(crate) fn new(
        safe_shutdown_duration: u64,
        handler: Box<dyn ShutdownHandler>,
    ) -> Arc<Self> {
        Arc::new(ShutdownCoordinator {
            sessions: DashMap::new(),
            state: Mutex::new(DrainState::default()),
            finalized: AtomicBool::new(false),
            safe_shutdown_duration,
            handler,
        })
    }

    pub(crate) fn is_draining(&self) -> bool {
        self.state.lock().unwrap().draining
    }

    pub(crate) fn live_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub(crate) fn on_session_open(&self, id: usize, browser: BrowserHandle) {
        self.sessions.insert(id, browser);
    }

    pub(crate) fn on_session_close(&self, id: usize) {
        if self.sessions.remove(&id).is_none() {
            return;
        }
        if self.sessions.is_empty() && self.is_draining() {
            self.finalize(REASON_ALL_DISCONNECTED);
        }
    }

    // A second request while draining stops immediately.
    pub(crate) fn request_shutdown(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        if state.draining {
            drop(state);
            self.finalize(REASON_FORCE_QUIT);
            return;
        }
        let live_sessions = self.live_sessions();
        if live_sessions == 0 || self.safe_shutdown_duration == 0 {
            drop(state);
            self.finalize(REASON_ALL_DISCONNECTED);
            return;
        }
        #[cfg(not(coverage_nightly))]
        warn!(
            %live_sessions,
            seconds = %self.safe_shutdown_duration,
            "Clients are still connected. Starting countdown; signal again to force quit."
        );
        state.draining = true;
        state.remaining = self.safe_shutdown_duration;
        let coordinator = Arc::downgrade(self);
        state.countdown = Some(DroppableHandle(tokio::spawn(countdown(coordinator))));
    }

    // Advances the countdown by one tick. Returns whether it should keep going.
    fn tick(&self) -> bool {
        let remaining = {
            let mut state = self.state.lock().unwrap();
            state.remaining = state.remaining.saturating_sub(1);
            state.remaining
        };
        if remaining == 0 {
            self.finalize(REASON_COUNTDOWN_OVER);
            return false;
        }
        for session in self.sessions.iter() {
            session.emit(BrowserEvent::ShutdownCountdownUpdate(remaining));
        }
        true
    }

    // Runs at most once.
    pub(crate) fn finalize(&self, reason: &str) {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return;
        }
        let countdown = self.state.lock().unwrap().countdown.take();
        let sessions: Vec<BrowserHandle> = self
            .sessions
            .iter()
            .map(|session| session.value().clone())
            .collect();
        for session in sessions {
            session.disconnect();
        }
        self.handler.stop(reason);
        drop(countdown);
    }
}

async fn countdown(coordinator: Weak<ShutdownCoordinator>) {
    let mut interval = interval_at(Instant::now() + COUNTDOWN_TICK, COUNTDOWN_TICK);
    loop {
        interval.tick().await;
        let Some(coordinator) = coordinator.upgrade() else {
            break;
        };
        if !coordinator.tick() {
            break;
        }
    }
}
