//! Mutable state shared by the bot's tasks. Everything sits behind one mutex
//! that is only held for the duration of a single named operation.

use crate::parsing::PendingSplit;
use chrono::{
    DateTime,
    Local,
};
use std::{
    collections::HashMap,
    sync::{
        Mutex,
        MutexGuard,
        PoisonError,
    },
    time::Duration,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const USER_COMMAND_COOLDOWN: Duration = Duration::from_secs(2);
pub const STALE_COMMAND_AGE: Duration = Duration::from_secs(5 * 60);
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);
pub const RECONNECT_STORM_WINDOW: Duration = Duration::from_secs(10 * 60);
pub const RECONNECT_STORM_THRESHOLD: u32 = 5;

/// `1h2m3s` style, truncated to whole seconds.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReconnectStatus {
    pub count: u32,
    pub high_frequency: bool,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Counters {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub reconnects: u32,
}

/// A pending "turn autoplay off at `at`" request.
#[derive(Debug)]
struct ScheduledOff {
    id: u64,
    at: DateTime<Local>,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct SessionInner {
    counters: Counters,
    last_reconnect: Option<Instant>,
    greeted: bool,
    last_sent: Option<String>,
    pending_split: Option<PendingSplit>,
    user_last_command: HashMap<String, Instant>,
    autoplay_enabled: bool,
    last_autoplay: Option<Instant>,
    scheduled_off: Option<ScheduledOff>,
    next_schedule_id: u64,
}

#[derive(Debug)]
pub struct Session {
    started_at: Instant,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub fn new(autoplay_enabled: bool) -> Self {
        Self {
            started_at: Instant::now(),
            inner: Mutex::new(SessionInner {
                autoplay_enabled,
                ..SessionInner::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn counters(&self) -> Counters {
        self.lock().counters
    }

    pub fn record_received(&self) {
        self.lock().counters.messages_received += 1;
    }

    pub fn record_sent(&self, message: &str) {
        let mut inner = self.lock();
        inner.counters.messages_sent += 1;
        inner.last_sent = Some(message.to_string());
    }

    pub fn last_sent(&self) -> Option<String> {
        self.lock().last_sent.clone()
    }

    /// Counts a reconnect. The counter restarts at 1 when the previous
    /// reconnect is older than [`RECONNECT_STORM_WINDOW`].
    pub fn track_reconnect(&self, now: Instant) -> ReconnectStatus {
        let mut inner = self.lock();
        let within_window = inner
            .last_reconnect
            .is_some_and(|last| now.saturating_duration_since(last) <= RECONNECT_STORM_WINDOW);
        inner.counters.reconnects = if within_window {
            inner.counters.reconnects.saturating_add(1)
        } else {
            1
        };
        inner.last_reconnect = Some(now);
        let count = inner.counters.reconnects;
        ReconnectStatus {
            count,
            high_frequency: count > RECONNECT_STORM_THRESHOLD,
        }
    }

    /// Returns `true` when the connect greeting should be sent, marking the
    /// session as greeted in the same step.
    pub fn begin_greeting(&self, greet_on_reconnect: bool) -> bool {
        let mut inner = self.lock();
        if inner.greeted && !greet_on_reconnect {
            return false;
        }
        inner.greeted = true;
        true
    }

    pub fn store_pending_split(&self, text: &str, now: Instant) {
        self.lock().pending_split = Some(PendingSplit::new(text, now));
    }

    /// Drains the split buffer. Expired entries are dropped and read as empty.
    pub fn take_pending_split(&self, now: Instant) -> Option<String> {
        self.lock()
            .pending_split
            .take()
            .filter(|pending| !pending.is_expired(now))
            .map(PendingSplit::into_text)
    }

    pub fn has_pending_split(&self) -> bool {
        self.lock().pending_split.is_some()
    }

    /// Returns `true` if `user` issued a command within the cooldown. Otherwise
    /// records `now` as their latest command.
    pub fn is_user_rate_limited(&self, user: &str, now: Instant) -> bool {
        let key = user.to_lowercase();
        let mut inner = self.lock();
        if let Some(last) = inner.user_last_command.get(&key) {
            if now.saturating_duration_since(*last) < USER_COMMAND_COOLDOWN {
                return true;
            }
        }
        inner.user_last_command.insert(key, now);
        false
    }

    /// Drops cooldown entries older than [`STALE_COMMAND_AGE`]; returns how
    /// many went.
    pub fn purge_stale_commands(&self, now: Instant) -> usize {
        let mut inner = self.lock();
        let before = inner.user_last_command.len();
        inner
            .user_last_command
            .retain(|_, last| now.saturating_duration_since(*last) <= STALE_COMMAND_AGE);
        before - inner.user_last_command.len()
    }

    pub fn autoplay_enabled(&self) -> bool {
        self.lock().autoplay_enabled
    }

    pub fn set_autoplay_enabled(&self, enabled: bool) {
        self.lock().autoplay_enabled = enabled;
    }

    pub fn record_autoplay(&self, now: Instant) {
        self.lock().last_autoplay = Some(now);
    }

    pub fn last_autoplay(&self) -> Option<Instant> {
        self.lock().last_autoplay
    }

    /// Enabled, and at least `interval` since the last recorded play.
    pub fn can_autoplay(&self, now: Instant, interval: Duration) -> bool {
        let inner = self.lock();
        inner.autoplay_enabled
            && inner
                .last_autoplay
                .is_none_or(|last| now.saturating_duration_since(last) >= interval)
    }

    /// Stores a new off-time, cancelling whatever was scheduled before. The
    /// returned id identifies this schedule to [`Session::complete_autoplay_off`].
    pub fn schedule_autoplay_off(&self, at: DateTime<Local>, cancel: CancellationToken) -> u64 {
        let mut inner = self.lock();
        if let Some(previous) = inner.scheduled_off.take() {
            previous.cancel.cancel();
        }
        inner.next_schedule_id += 1;
        let id = inner.next_schedule_id;
        inner.scheduled_off = Some(ScheduledOff { id, at, cancel });
        id
    }

    /// Returns whether a schedule was pending.
    pub fn cancel_autoplay_off(&self) -> bool {
        match self.lock().scheduled_off.take() {
            Some(scheduled) => {
                scheduled.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Called by the timer of schedule `id` when it fires. Turns autoplay off
    /// only if that schedule is still the current one.
    pub fn complete_autoplay_off(&self, id: u64) -> bool {
        let mut inner = self.lock();
        if inner.scheduled_off.as_ref().is_none_or(|s| s.id != id) {
            return false;
        }
        inner.scheduled_off = None;
        inner.autoplay_enabled = false;
        true
    }

    pub fn autoplay_off_at(&self) -> Option<DateTime<Local>> {
        self.lock().scheduled_off.as_ref().map(|s| s.at)
    }
}
