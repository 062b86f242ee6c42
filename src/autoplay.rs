//! Periodic slot plays and the "turn autoplay off later" timer.

use crate::session::Session;
use chrono::{
    DateTime,
    Local,
    NaiveTime,
    TimeDelta,
    TimeZone,
};
use rand::Rng;
use regex::Regex;
use std::{
    sync::{
        Arc,
        LazyLock,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    info,
};

/// Wait after startup before the first play.
pub const INITIAL_PLAY_DELAY: Duration = Duration::from_secs(4);
/// Extra wait after each jittered interval.
pub const POST_INTERVAL_DELAY: Duration = Duration::from_secs(3);
pub const JITTER_FRACTION: f64 = 0.02;
/// Longest accepted relative turn-off delay, about 292 years.
pub const MAX_RELATIVE_DURATION: Duration = Duration::from_secs(i64::MAX as u64 / 1_000_000_000);

static CLOCK_TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9]{1,2}):([0-9]{2})$").expect("clock pattern is valid"));
static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[0-9]+(?:\.[0-9]+)?(?:ms|h|m|s))+$").expect("duration pattern is valid")
});
static DURATION_PART_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([0-9]+(?:\.[0-9]+)?)(ms|h|m|s)").expect("duration part pattern is valid")
});

/// `base` plus `|base * fraction * (2r - 1)|` for `r` in `[0, 1)`. Jitter only
/// ever lengthens the interval.
pub fn jitter_duration(base: Duration, fraction: f64, r: f64) -> Duration {
    let jitter = (base.as_secs_f64() * fraction * (2.0 * r - 1.0)).abs();
    base + Duration::from_secs_f64(jitter)
}

pub fn random_jitter(base: Duration) -> Duration {
    let r = rand::rng().random::<f64>();
    jitter_duration(base, JITTER_FRACTION, r)
}

/// Parses `2h`, `30m`, `1h30m`, `90s`, `1.5h`, `500ms`. Zero and anything
/// past [`MAX_RELATIVE_DURATION`] are rejected.
pub fn parse_relative_duration(raw: &str) -> Option<Duration> {
    if !DURATION_RE.is_match(raw) {
        return None;
    }
    let mut total = 0f64;
    for part in DURATION_PART_RE.captures_iter(raw) {
        let value: f64 = part[1].parse().ok()?;
        let seconds = match &part[2] {
            "h" => value * 3600.0,
            "m" => value * 60.0,
            "s" => value,
            "ms" => value / 1000.0,
            _ => return None,
        };
        total += seconds;
    }
    let duration = Duration::try_from_secs_f64(total).ok()?;
    (!duration.is_zero() && duration <= MAX_RELATIVE_DURATION).then_some(duration)
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OffRequest<Tz: TimeZone> {
    Cancel,
    /// A clock time; rolled to tomorrow if it is not in the future.
    At(DateTime<Tz>),
    After {
        delay: Duration,
        at: DateTime<Tz>,
    },
}

#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum OffTimeError {
    #[error("hour or minute out of range")]
    InvalidClockTime,
    #[error("not a clock time or duration")]
    Unrecognised,
}

/// Reads the argument of the schedule-off command. Forms are tried in order:
/// `cancel`/`anuluj`, `HH:MM`, then a relative duration.
pub fn parse_off_time<Tz: TimeZone>(
    arg: &str,
    now: &DateTime<Tz>,
) -> Result<OffRequest<Tz>, OffTimeError> {
    let arg = arg.trim().to_lowercase();
    if arg == "cancel" || arg == "anuluj" {
        return Ok(OffRequest::Cancel);
    }

    if let Some(captures) = CLOCK_TIME_RE.captures(&arg) {
        let hour: u32 = captures[1].parse().map_err(|_| OffTimeError::InvalidClockTime)?;
        let minute: u32 = captures[2].parse().map_err(|_| OffTimeError::InvalidClockTime)?;
        let time =
            NaiveTime::from_hms_opt(hour, minute, 0).ok_or(OffTimeError::InvalidClockTime)?;
        let mut at = now
            .date_naive()
            .and_time(time)
            .and_local_timezone(now.timezone())
            .earliest()
            .ok_or(OffTimeError::InvalidClockTime)?;
        if at <= *now {
            at = at + TimeDelta::days(1);
        }
        return Ok(OffRequest::At(at));
    }

    let delay = parse_relative_duration(&arg).ok_or(OffTimeError::Unrecognised)?;
    let offset = TimeDelta::from_std(delay).map_err(|_| OffTimeError::Unrecognised)?;
    let at = now
        .clone()
        .checked_add_signed(offset)
        .ok_or(OffTimeError::Unrecognised)?;
    Ok(OffRequest::After { delay, at })
}

/// Drives autoplay: the periodic play loop and the deferred turn-off timer.
pub struct AutoplayScheduler {
    session: Arc<Session>,
    interval: Duration,
    cancel: CancellationToken,
}

impl AutoplayScheduler {
    pub fn new(session: Arc<Session>, interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            session,
            interval,
            cancel,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Plays once after [`INITIAL_PLAY_DELAY`], then once per jittered interval
    /// while autoplay is on and the last play is at least an interval old.
    pub async fn run<F, Fut>(&self, mut play: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        if !self.sleep(INITIAL_PLAY_DELAY).await {
            return;
        }
        play().await;

        loop {
            if !self.sleep(random_jitter(self.interval)).await
                || !self.sleep(POST_INTERVAL_DELAY).await
            {
                break;
            }
            if !self.session.autoplay_enabled() {
                continue;
            }
            if !self.session.can_autoplay(time::Instant::now(), self.interval) {
                debug!("slots cooldown active, skipping this cycle");
                continue;
            }
            play().await;
        }
        debug!("autoplay loop stopped");
    }

    /// Returns `false` if cancelled first.
    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = time::sleep(duration) => true,
        }
    }

    /// Turns autoplay off at `at`, replacing any pending schedule.
    pub fn schedule_off(&self, at: DateTime<Local>) {
        let token = self.cancel.child_token();
        let id = self.session.schedule_autoplay_off(at, token.clone());
        let delay = (at - Local::now()).to_std().unwrap_or_default();
        let session = self.session.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = time::sleep(delay) => {
                    if session.complete_autoplay_off(id) {
                        info!("auto slots turned off (scheduled)");
                    }
                }
            }
        });
    }

    pub fn cancel_off(&self) -> bool {
        self.session.cancel_autoplay_off()
    }

    pub fn off_at(&self) -> Option<DateTime<Local>> {
        self.session.autoplay_off_at()
    }
}
