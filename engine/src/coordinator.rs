//! Cross-worker rate-limit pause/resume and cooperative shutdown.
//!
//! Workers only ever set the pause (`signal_rate_limit`); only the pool owner
//! clears it (`resume_all_workers`). Shutdown is a separate token so callers can
//! thread it through layers that never see the coordinator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::core::rate_limit::RateLimitInfo;

/// Cloneable cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    flag: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early on shutdown. Returns `false` if interrupted.
    pub fn sleep(&self, duration: Duration, poll: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_requested() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(poll.min(deadline - now));
        }
    }
}

#[derive(Debug, Default)]
struct PauseState {
    paused: bool,
    info: Option<RateLimitInfo>,
    /// The owner already consumed this episode's info.
    info_taken: bool,
    /// Incremented on every resume.
    episode: u64,
}

/// Shared pause/resume signalling between pool workers and the pool owner.
#[derive(Debug)]
pub struct RateLimitCoordinator {
    state: Mutex<PauseState>,
    resumed: Condvar,
    shutdown: ShutdownToken,
    poll: Duration,
}

impl RateLimitCoordinator {
    pub fn new(shutdown: ShutdownToken, poll: Duration) -> Self {
        Self {
            state: Mutex::new(PauseState::default()),
            resumed: Condvar::new(),
            shutdown,
            poll,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PauseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pause every worker. The first signal of an episode wins; later signals
    /// may only lengthen the retry-after before the owner takes it.
    pub fn signal_rate_limit(&self, info: RateLimitInfo) {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.info_taken {
            debug!(source = %info.source, "rate limit signal during active wait ignored");
        } else if let Some(current) = state.info.as_mut() {
            current.lengthen(&info);
        } else {
            info!(source = %info.source, retry_after_secs = ?info.retry_after_secs, "rate limit pause");
            state.info = Some(info);
        }
        state.paused = true;
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    /// Block while paused. Returns `false` if shutdown was requested.
    ///
    /// Never clears the pause itself.
    pub fn check_if_paused(&self) -> bool {
        let mut state = self.lock();
        while state.paused {
            if self.shutdown.is_requested() {
                return false;
            }
            state = self
                .resumed
                .wait_timeout(state, self.poll)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        !self.shutdown.is_requested()
    }

    /// The current episode's info, handed out once.
    pub fn take_rate_limit_info(&self) -> Option<RateLimitInfo> {
        let mut state = self.lock();
        if !state.paused || state.info_taken {
            return None;
        }
        state.info_taken = true;
        state.info.clone()
    }

    /// Clear the pause and wake every waiting worker. `false` when not paused.
    pub fn resume_all_workers(&self) -> bool {
        let mut state = self.lock();
        if !state.paused {
            return false;
        }
        state.paused = false;
        state.info = None;
        state.info_taken = false;
        state.episode += 1;
        let episode = state.episode;
        drop(state);
        self.resumed.notify_all();
        info!(episode, "workers resumed");
        true
    }

    pub fn signal_shutdown(&self) {
        self.shutdown.request();
        self.resumed.notify_all();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.is_requested()
    }

    pub fn shutdown_token(&self) -> &ShutdownToken {
        &self.shutdown
    }

    /// Completed pause episodes.
    pub fn episodes(&self) -> u64 {
        self.lock().episode
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;

    use super::*;
    use crate::core::rate_limit::RateLimitSource;

    fn coordinator() -> RateLimitCoordinator {
        RateLimitCoordinator::new(ShutdownToken::new(), Duration::from_millis(10))
    }

    fn info(retry: f64) -> RateLimitInfo {
        RateLimitInfo::new(RateLimitSource::Agent, Some(retry), "429")
    }

    #[test]
    fn resume_takes_effect_once_per_episode() {
        let coord = coordinator();
        assert!(!coord.resume_all_workers());
        coord.signal_rate_limit(info(1.0));
        assert!(coord.resume_all_workers());
        assert!(!coord.resume_all_workers());
        assert_eq!(coord.episodes(), 1);
    }

    #[test]
    fn first_signal_wins_but_may_be_lengthened() {
        let coord = coordinator();
        coord.signal_rate_limit(info(5.0));
        coord.signal_rate_limit(RateLimitInfo::new(RateLimitSource::Judge, Some(30.0), "later"));
        let taken = coord.take_rate_limit_info().expect("info");
        assert_eq!(taken.source, RateLimitSource::Agent);
        assert_eq!(taken.retry_after_secs, Some(30.0));
        assert!(coord.take_rate_limit_info().is_none());

        coord.signal_rate_limit(info(99.0));
        assert!(coord.is_paused());
        assert!(coord.resume_all_workers());
        assert!(coord.take_rate_limit_info().is_none());
    }

    #[test]
    fn workers_stay_paused_until_owner_resumes() {
        let coord = Arc::new(coordinator());
        coord.signal_rate_limit(info(1.0));
        let (tx, rx) = mpsc::channel();
        let worker = {
            let coord = Arc::clone(&coord);
            thread::spawn(move || {
                let proceed = coord.check_if_paused();
                tx.send(proceed).expect("send");
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(coord.is_paused());
        assert!(coord.resume_all_workers());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(true));
        worker.join().expect("join");
    }

    #[test]
    fn shutdown_releases_paused_workers() {
        let coord = Arc::new(coordinator());
        coord.signal_rate_limit(info(1.0));
        let worker = {
            let coord = Arc::clone(&coord);
            thread::spawn(move || coord.check_if_paused())
        };
        coord.signal_shutdown();
        assert!(!worker.join().expect("join"));
        assert!(coord.is_paused());
    }

    #[test]
    fn token_sleep_is_interruptible() {
        let token = ShutdownToken::new();
        assert!(token.sleep(Duration::from_millis(20), Duration::from_millis(5)));
        token.request();
        assert!(!token.sleep(Duration::from_secs(60), Duration::from_millis(5)));
    }
}
