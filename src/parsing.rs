//! Turns the monitored bot's free-text announcements into typed economic
//! events. Every function here is pure; the caller decides what to do with the
//! outcome.

use regex::Regex;
use std::{
    fmt,
    sync::LazyLock,
    time::Duration,
};
use tokio::time::Instant;

/// Leaderboard posts list other users' totals in the same `name (points)`
/// shape as payouts.
const LEADERBOARD_MARKER: &str = "top 5 users based on points";
const MAX_LINE_LEN: usize = 1000;
const MAX_POINTS_DIGITS: usize = 20;

pub const HEIST_RESULTS_MARKER: &str = "Results from the Heist:";
pub const ARENA_RESULTS_MARKER: &str = "The dust finally settled";
pub const SLOTS_LEVER_SUFFIX: &str = " pulls the lever and waits for the roll";
const SLOTS_COOLDOWN_REFUND: &str = "he command is still on user cooldown for";

/// How long the first half of a split announcement waits for its second half.
pub const SPLIT_TTL: Duration = Duration::from_secs(5);

static BALANCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bbombs:\s*([0-9]+)").expect("balance pattern is valid")
});

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SlotsTag {
    Lost,
    Refund,
    SmallWin,
    Jackpot,
    SuperJackpot,
}

impl SlotsTag {
    pub fn as_str(self) -> &'static str {
        match self {
            SlotsTag::Lost => "lost",
            SlotsTag::Refund => "refund",
            SlotsTag::SmallWin => "small_win",
            SlotsTag::Jackpot => "jackpot",
            SlotsTag::SuperJackpot => "super_jackpot",
        }
    }
}

impl fmt::Display for SlotsTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SlotsOutcome {
    pub delta: i64,
    pub tag: SlotsTag,
}

impl SlotsOutcome {
    const fn new(delta: i64, tag: SlotsTag) -> Self {
        Self { delta, tag }
    }
}

/// Extracts the `bombs: N` balance announced for `name`.
pub fn parse_balance(line: &str, name: &str) -> Option<i64> {
    if !line.to_lowercase().contains(&name.to_lowercase()) {
        return None;
    }
    let captures = BALANCE_RE.captures(line)?;
    captures[1].parse().ok()
}

/// Classifies a slot machine result addressed to `name`. Phrases are checked
/// in precedence order, so "super jackpot" never reads as a plain jackpot.
pub fn parse_slots_outcome(line: &str, name: &str) -> Option<SlotsOutcome> {
    let lower = line.to_lowercase();
    if !lower.contains(&name.to_lowercase()) {
        return None;
    }

    let outcome = if lower.contains("you lost") {
        SlotsOutcome::new(0, SlotsTag::Lost)
    } else if lower.contains("super jackpot") {
        SlotsOutcome::new(60_000, SlotsTag::SuperJackpot)
    } else if lower.contains("jackpot") {
        SlotsOutcome::new(20_000, SlotsTag::Jackpot)
    } else if lower.contains("even a small win is a win") {
        SlotsOutcome::new(6_000, SlotsTag::SmallWin)
    } else if lower.contains("you at least got your points back")
        || lower.contains(SLOTS_COOLDOWN_REFUND)
    {
        SlotsOutcome::new(2_000, SlotsTag::Refund)
    } else {
        return None;
    };
    Some(outcome)
}

/// Reads the `name (1 234)` payout shape. The name match is case-sensitive and
/// the last occurrence on the line wins.
pub fn parse_payout(line: &str, name: &str) -> Option<i64> {
    if line.contains(LEADERBOARD_MARKER) || line.len() > MAX_LINE_LEN {
        return None;
    }

    let pattern = format!(
        r"^.*{}[\t\n\x0C\r ]*\([\t\n\x0C\r ]*([0-9\t\n\x0C\r ]+)\)",
        regex::escape(name)
    );
    let re = Regex::new(&pattern).ok()?;
    let captures = re.captures(line)?;
    let group = &captures[1];
    if group.len() > MAX_POINTS_DIGITS {
        return None;
    }
    group.replace(' ', "").parse().ok()
}

/// First half of an announcement the remote side split across two lines.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PendingSplit {
    text: String,
    stored_at: Instant,
}

impl PendingSplit {
    pub fn new(text: impl Into<String>, stored_at: Instant) -> Self {
        Self {
            text: text.into(),
            stored_at,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) > SPLIT_TTL
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }
}

/// Joins a continuation line (`(...`) onto the buffered first half. The caller
/// always drains the buffer before calling, so the buffer is empty afterwards
/// whichever branch is taken.
pub fn reassemble_split(line: &str, pending: Option<String>) -> String {
    match pending {
        Some(first_half) if line.starts_with('(') => format!("{first_half} {line}"),
        _ => line.to_string(),
    }
}

/// A payout announcement that ends in the bare name was cut before the
/// `(points)` part.
pub fn is_split_start(line: &str, name: &str) -> bool {
    !line.contains(&format!("{name} ("))
        && line.ends_with(name)
        && (line.contains(HEIST_RESULTS_MARKER) || line.contains(ARENA_RESULTS_MARKER))
}

/// What a (reassembled) line from the monitored bot means for us. `None`
/// payloads mark lines that looked like the announcement but did not parse.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BotLine {
    Balance(Option<i64>),
    Slots(Option<SlotsOutcome>),
    HeistPayout(Option<i64>),
    ArenaPayout(Option<i64>),
    Points(Option<i64>),
    SplitStart,
    Cooldown,
    InsufficientFunds,
    Other,
}

pub fn classify_bot_line(line: &str, username: &str) -> BotLine {
    let lower = line.to_lowercase();
    let user_lower = username.to_lowercase();

    if lower.contains("bombs:") && lower.contains(&user_lower) {
        return BotLine::Balance(parse_balance(line, username));
    }

    if line.starts_with(&format!("{username}{SLOTS_LEVER_SUFFIX}")) {
        return BotLine::Slots(parse_slots_outcome(line, username));
    }

    if line.contains(&format!("{username} (")) {
        let payout = parse_payout(line, username);
        if line.contains(HEIST_RESULTS_MARKER) {
            return BotLine::HeistPayout(payout);
        }
        if line.contains(ARENA_RESULTS_MARKER) {
            return BotLine::ArenaPayout(payout);
        }
        return BotLine::Points(payout);
    }

    if is_split_start(line, username) {
        return BotLine::SplitStart;
    }

    if lower.starts_with(&user_lower) && lower.contains("cooldown") {
        return BotLine::Cooldown;
    }

    if lower.contains(&user_lower) && lower.contains("doesn't have") && lower.contains("bombs")
    {
        return BotLine::InsufficientFunds;
    }

    BotLine::Other
}
