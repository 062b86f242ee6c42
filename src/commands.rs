//! Chat commands for the owner and trusted users. Handlers return the reply
//! to post; the bot sends it.

use crate::{
    autoplay::{
        AutoplayScheduler,
        OffRequest,
        OffTimeError,
        parse_off_time,
    },
    config::ConfigStore,
    gambling::{
        MAX_HEIST,
        MIN_HEIST,
    },
    session::{
        Session,
        format_duration,
    },
    trusted::{
        TrustChange,
        TrustedUsers,
    },
    wallet::Wallet,
};
use chrono::Local;
use itertools::Itertools;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{
    debug,
    info,
    warn,
};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParsedCommand {
    pub name: String,
    pub args: Vec<String>,
}

/// Strips the prefix (case-insensitively) and splits on whitespace. The
/// command name is lowercased; arguments keep their case.
pub fn split_command(line: &str, prefix: &str) -> Option<ParsedCommand> {
    let line = line.trim();
    let head = line.get(..prefix.len())?;
    if prefix.is_empty() || !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    let mut parts = line[prefix.len()..].split_whitespace();
    let name = parts.next()?.to_lowercase();
    Some(ParsedCommand {
        name,
        args: parts.map(String::from).collect(),
    })
}

/// A trusted user's line is a command if it starts with the prefix, or with
/// `@owner`/`owner` (optionally followed by `,`) and then the prefix. Returns
/// the line with any mention removed.
pub fn extract_trusted_command(line: &str, owner: &str, prefix: &str) -> Option<String> {
    let lower = line.trim().to_lowercase();
    let prefix = prefix.to_lowercase();
    if lower.starts_with(&prefix) {
        return Some(lower);
    }
    let owner = owner.to_lowercase();
    let rest = lower
        .strip_prefix(&format!("@{owner}"))
        .or_else(|| lower.strip_prefix(&owner))?;
    let rest = rest.trim_start();
    let rest = rest.strip_prefix(',').unwrap_or(rest).trim_start();
    rest.starts_with(&prefix).then(|| rest.to_string())
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Command {
    Status,
    SetHeist,
    GetHeist,
    AutoSlots,
    SlotsOff,
    Trust,
    Untrust,
    TrustList,
    Help,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Access {
    Trusted,
    Owner,
}

impl Command {
    fn access(self) -> Access {
        match self {
            Command::Trust | Command::Untrust | Command::TrustList => Access::Owner,
            _ => Access::Trusted,
        }
    }
}

pub struct CommandDispatcher {
    config: Arc<ConfigStore>,
    wallet: Arc<Wallet>,
    session: Arc<Session>,
    trusted: Arc<TrustedUsers>,
    autoplay: Arc<AutoplayScheduler>,
    status_command: String,
}

impl CommandDispatcher {
    pub fn new(
        config: Arc<ConfigStore>,
        wallet: Arc<Wallet>,
        session: Arc<Session>,
        trusted: Arc<TrustedUsers>,
        autoplay: Arc<AutoplayScheduler>,
    ) -> Self {
        let status_command = config.config().status_command.to_lowercase();
        Self {
            config,
            wallet,
            session,
            trusted,
            autoplay,
            status_command,
        }
    }

    pub fn lookup(&self, name: &str) -> Option<Command> {
        let name = name.to_lowercase();
        if name == self.status_command {
            return Some(Command::Status);
        }
        let command = match name.as_str() {
            "setheist" => Command::SetHeist,
            "getheist" => Command::GetHeist,
            "autoslots" => Command::AutoSlots,
            "slotsoff" => Command::SlotsOff,
            "trust" => Command::Trust,
            "untrust" => Command::Untrust,
            "trustlist" => Command::TrustList,
            "help" => Command::Help,
            _ => return None,
        };
        Some(command)
    }

    /// Whether `line` names one of our commands (as opposed to text meant for
    /// the channel).
    pub fn is_internal_command(&self, line: &str) -> bool {
        split_command(line, self.prefix()).is_some_and(|parsed| self.lookup(&parsed.name).is_some())
    }

    fn prefix(&self) -> &str {
        &self.config.config().prefix
    }

    /// Runs `line` on behalf of `user`. Returns `None` when nothing should be
    /// said: not a command, cooldown, unknown command or missing permission.
    pub fn dispatch(&self, user: &str, line: &str, now: Instant) -> Option<String> {
        let parsed = split_command(line, self.prefix())?;
        let is_owner = self.trusted.is_owner(user);
        if !is_owner && self.session.is_user_rate_limited(user, now) {
            debug!(%user, command = %parsed.name, "command dropped by cooldown");
            return None;
        }

        let command = self.lookup(&parsed.name)?;
        let allowed = match command.access() {
            Access::Owner => is_owner,
            Access::Trusted => self.trusted.is_trusted(user),
        };
        if !allowed {
            debug!(%user, ?command, "command not permitted");
            return None;
        }

        let args = &parsed.args;
        let reply = match command {
            Command::Status => self.status(user),
            Command::SetHeist => self.set_heist(user, args),
            Command::GetHeist => format!(
                "@{user}, current heist is {}",
                self.config.default_heist()
            ),
            Command::AutoSlots => self.auto_slots(user, args),
            Command::SlotsOff => self.slots_off(user, args),
            Command::Trust => self.trust(user, args),
            Command::Untrust => self.untrust(user, args),
            Command::TrustList => self.trust_list(user),
            Command::Help => self.help(is_owner),
        };
        Some(reply)
    }

    fn status(&self, user: &str) -> String {
        format!(
            "@{user}, bot is running ;) | Bombs: {} | Heist: {}",
            self.wallet.balance(),
            self.config.default_heist()
        )
    }

    fn set_heist(&self, user: &str, args: &[String]) -> String {
        let usage = format!("@{user}, give a number from {MIN_HEIST} to {MAX_HEIST}!");
        let Some(amount) = args
            .first()
            .and_then(|raw| raw.parse::<i64>().ok())
            .filter(|amount| (MIN_HEIST..=MAX_HEIST).contains(amount))
        else {
            return usage;
        };

        if let Err(err) = self.config.update_heist(amount) {
            warn!(?err, amount, "could not persist heist amount");
            return format!("@{user}, heist set to {amount} for now, but saving it failed!");
        }
        info!(%user, amount, "heist amount updated");
        format!("@{user}, heist amount changed to {amount}!")
    }

    fn auto_slots(&self, user: &str, args: &[String]) -> String {
        let Some(arg) = args.first() else {
            let state = if self.session.autoplay_enabled() {
                "on"
            } else {
                "off"
            };
            return format!("@{user}, auto slots is {state}. Use: {}autoslots on/off", self.prefix());
        };

        match arg.to_lowercase().as_str() {
            "on" | "1" | "true" | "wlacz" | "włącz" => {
                self.session.set_autoplay_enabled(true);
                info!(%user, "auto slots enabled");
                format!("@{user}, auto slots enabled!")
            }
            "off" | "0" | "false" | "wylacz" | "wyłącz" => {
                self.session.set_autoplay_enabled(false);
                info!(%user, "auto slots disabled");
                format!("@{user}, auto slots disabled!")
            }
            _ => format!("@{user}, use: {}autoslots on/off", self.prefix()),
        }
    }

    fn slots_off(&self, user: &str, args: &[String]) -> String {
        let prefix = self.prefix();
        let Some(arg) = args.first() else {
            return match self.autoplay.off_at() {
                Some(at) => {
                    let remaining = (at - Local::now()).to_std().unwrap_or_default();
                    format!(
                        "@{user}, auto slots turns off at {} (in {})",
                        at.format("%H:%M"),
                        format_duration(remaining)
                    )
                }
                None => format!(
                    "@{user}, nothing scheduled. Use: {prefix}slotsoff <HH:MM> or {prefix}slotsoff <duration>"
                ),
            };
        };

        match parse_off_time(arg, &Local::now()) {
            Ok(OffRequest::Cancel) => {
                if self.autoplay.cancel_off() {
                    info!(%user, "scheduled auto slots turn-off cancelled");
                    format!("@{user}, scheduled turn-off cancelled.")
                } else {
                    format!("@{user}, nothing scheduled.")
                }
            }
            Ok(OffRequest::At(at)) => {
                self.autoplay.schedule_off(at);
                info!(%user, at = %at.format("%H:%M"), "auto slots turn-off scheduled");
                format!("@{user}, auto slots turns off at {}", at.format("%H:%M"))
            }
            Ok(OffRequest::After { delay, at }) => {
                self.autoplay.schedule_off(at);
                info!(%user, ?delay, "auto slots turn-off scheduled");
                format!(
                    "@{user}, auto slots turns off in {} (at {})",
                    format_duration(delay),
                    at.format("%H:%M")
                )
            }
            Err(OffTimeError::InvalidClockTime) => {
                format!("@{user}, invalid time. Use HH:MM (e.g. 22:00)")
            }
            Err(OffTimeError::Unrecognised) => format!(
                "@{user}, use: {prefix}slotsoff <HH:MM> or {prefix}slotsoff <duration> (e.g. 2h, 30m, 1h30m)"
            ),
        }
    }

    fn trust(&self, user: &str, args: &[String]) -> String {
        let Some(target) = args.first().map(|t| t.to_lowercase()) else {
            return format!("@{user}, use: {}trust <nick>", self.prefix());
        };
        match self.trusted.add(&target) {
            TrustChange::IsOwner => format!("@{user}, you cannot add yourself!"),
            TrustChange::AlreadyTrusted => format!("@{user}, {target} is already trusted"),
            _ => {
                info!(%user, %target, "trusted user added");
                format!("@{user}, added {target} to trusted users!")
            }
        }
    }

    fn untrust(&self, user: &str, args: &[String]) -> String {
        let Some(target) = args.first().map(|t| t.to_lowercase()) else {
            return format!("@{user}, use: {}untrust <nick>", self.prefix());
        };
        match self.trusted.remove(&target) {
            TrustChange::Removed => {
                info!(%user, %target, "trusted user removed");
                format!("@{user}, removed {target} from trusted users!")
            }
            TrustChange::IsOwner => format!("@{user}, you cannot remove yourself!"),
            _ => format!("@{user}, {target} is not a trusted user"),
        }
    }

    fn trust_list(&self, user: &str) -> String {
        let users = self.trusted.list();
        if users.is_empty() {
            return format!("@{user}, the trusted list is empty.");
        }
        format!("@{user}, trusted: {}", users.iter().join(", "))
    }

    fn help(&self, is_owner: bool) -> String {
        let p = self.prefix();
        let mut lines = vec![
            "Commands (trusted):".to_string(),
            format!("{p}{} - bot status", self.status_command),
            format!("{p}setheist <amount> - set heist"),
            format!("{p}getheist - show heist"),
            format!("{p}autoslots on/off - auto slots"),
            format!("{p}slotsoff <time/duration> - schedule turn-off"),
            format!("{p}help - this help"),
        ];
        if is_owner {
            lines.push(format!("{p}trust/untrust <nick>, {p}trustlist - manage trusted users"));
        }
        lines.join(" | ")
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::test_helpers::{
        MemoryConfigWriter,
        MemoryTrustedUserStore,
        test_config,
    };
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        dispatcher: CommandDispatcher,
        config: Arc<ConfigStore>,
        session: Arc<Session>,
        trusted: Arc<TrustedUsers>,
        writer: MemoryConfigWriter,
    }

    // owner is "gambler", "bob" is trusted
    fn fixture() -> Fixture {
        let writer = MemoryConfigWriter::default();
        let config = Arc::new(ConfigStore::new(test_config(), Box::new(writer.clone())).unwrap());
        let session = Arc::new(Session::new(false));
        let trusted = Arc::new(TrustedUsers::load(
            "gambler",
            Box::new(MemoryTrustedUserStore::with_users(&["bob"])),
        ));
        let autoplay = Arc::new(AutoplayScheduler::new(
            session.clone(),
            Duration::from_secs(900),
            CancellationToken::new(),
        ));
        let dispatcher = CommandDispatcher::new(
            config.clone(),
            Arc::new(Wallet::new(5_000)),
            session.clone(),
            trusted.clone(),
            autoplay,
        );
        Fixture {
            dispatcher,
            config,
            session,
            trusted,
            writer,
        }
    }

    #[test]
    fn split_command__lowercases_name_and_keeps_arg_case() {
        assert_eq!(
            split_command("!TRUST UserName other", "!"),
            Some(ParsedCommand {
                name: "trust".to_string(),
                args: vec!["UserName".to_string(), "other".to_string()],
            })
        );
        assert_eq!(
            split_command("  bot!status ", "bot!"),
            Some(ParsedCommand {
                name: "status".to_string(),
                args: vec![],
            })
        );
    }

    #[test]
    fn split_command__rejects_missing_prefix_or_name() {
        assert_eq!(split_command("!status", "?"), None);
        assert_eq!(split_command("!   ", "!"), None);
        assert_eq!(split_command("status", "!"), None);
        assert_eq!(split_command("", "!"), None);
    }

    #[test]
    fn extract_trusted_command__accepts_prefix_and_mentions() {
        assert_eq!(
            extract_trusted_command("!status", "gambler", "!").as_deref(),
            Some("!status")
        );
        assert_eq!(
            extract_trusted_command("@Gambler, !autoslots on", "gambler", "!").as_deref(),
            Some("!autoslots on")
        );
        assert_eq!(
            extract_trusted_command("gambler !help", "gambler", "!").as_deref(),
            Some("!help")
        );
        assert_eq!(extract_trusted_command("hello gambler", "gambler", "!"), None);
        assert_eq!(extract_trusted_command("@gambler hi", "gambler", "!"), None);
    }

    #[tokio::test]
    async fn dispatch__status_replies_to_trusted_user() {
        // given
        let fx = fixture();

        // when
        let reply = fx.dispatcher.dispatch("bob", "!status", Instant::now());

        // then
        assert_eq!(
            reply.as_deref(),
            Some("@bob, bot is running ;) | Bombs: 5000 | Heist: 1000")
        );
    }

    #[tokio::test]
    async fn dispatch__untrusted_user_cannot_trust_anyone() {
        // given
        let fx = fixture();

        // when
        let reply = fx.dispatcher.dispatch("mallory", "!trust mallory", Instant::now());

        // then
        assert_eq!(reply, None);
        assert!(!fx.trusted.is_trusted("mallory"));
    }

    #[tokio::test]
    async fn dispatch__trusted_user_cannot_use_owner_commands() {
        let fx = fixture();
        assert_eq!(fx.dispatcher.dispatch("bob", "!trust carol", Instant::now()), None);
        assert!(!fx.trusted.is_trusted("carol"));
    }

    #[tokio::test]
    async fn dispatch__second_command_within_cooldown_is_dropped() {
        // given
        let fx = fixture();
        let now = Instant::now();

        // when
        let first = fx.dispatcher.dispatch("bob", "!autoslots on", now);
        let second = fx.dispatcher.dispatch("bob", "!autoslots off", now + Duration::from_secs(1));

        // then
        assert!(first.is_some());
        assert_eq!(second, None);
        assert!(fx.session.autoplay_enabled());
    }

    #[tokio::test]
    async fn dispatch__owner_is_exempt_from_cooldown() {
        let fx = fixture();
        let now = Instant::now();
        assert!(fx.dispatcher.dispatch("gambler", "!getheist", now).is_some());
        assert!(fx.dispatcher.dispatch("gambler", "!getheist", now).is_some());
    }

    #[tokio::test]
    async fn dispatch__set_heist_validates_and_persists() {
        // given
        let fx = fixture();
        let now = Instant::now();

        // when
        let rejected = fx.dispatcher.dispatch("gambler", "!setheist 20000", now);
        let accepted = fx.dispatcher.dispatch("gambler", "!setheist 2500", now);

        // then
        assert_eq!(rejected.as_deref(), Some("@gambler, give a number from 1 to 10000!"));
        assert_eq!(accepted.as_deref(), Some("@gambler, heist amount changed to 2500!"));
        assert_eq!(fx.config.default_heist(), 2_500);
        assert_eq!(fx.writer.last_persisted(), Some(2_500));
    }

    #[tokio::test]
    async fn dispatch__set_heist_reports_persist_failure() {
        let fx = fixture();
        fx.writer.fail(true);
        let reply = fx.dispatcher.dispatch("gambler", "!setheist 300", Instant::now());
        assert_eq!(
            reply.as_deref(),
            Some("@gambler, heist set to 300 for now, but saving it failed!")
        );
        assert_eq!(fx.config.default_heist(), 300);
    }

    #[tokio::test]
    async fn dispatch__autoslots_reports_and_rejects_unknown_values() {
        let fx = fixture();
        let now = Instant::now();
        assert_eq!(
            fx.dispatcher.dispatch("gambler", "!autoslots", now).as_deref(),
            Some("@gambler, auto slots is off. Use: !autoslots on/off")
        );
        assert_eq!(
            fx.dispatcher.dispatch("gambler", "!autoslots maybe", now).as_deref(),
            Some("@gambler, use: !autoslots on/off")
        );
        fx.dispatcher.dispatch("gambler", "!autoslots włącz", now);
        assert!(fx.session.autoplay_enabled());
    }

    #[tokio::test]
    async fn dispatch__slotsoff_schedule_replace_and_cancel() {
        // given
        let fx = fixture();
        let now = Instant::now();

        // when
        fx.dispatcher.dispatch("gambler", "!slotsoff 2h", now);
        let first = fx.session.autoplay_off_at();
        fx.dispatcher.dispatch("gambler", "!slotsoff 30m", now);
        let second = fx.session.autoplay_off_at();
        let cancelled = fx.dispatcher.dispatch("gambler", "!slotsoff cancel", now);

        // then
        let first = first.unwrap();
        let expected = Local::now() + chrono::TimeDelta::hours(2);
        assert!((expected - first).num_seconds().abs() <= 5);
        assert!(second.unwrap() < first);
        assert_eq!(cancelled.as_deref(), Some("@gambler, scheduled turn-off cancelled."));
        assert_eq!(fx.session.autoplay_off_at(), None);
    }

    #[tokio::test]
    async fn dispatch__slotsoff_invalid_input_changes_nothing() {
        let fx = fixture();
        let now = Instant::now();
        assert_eq!(
            fx.dispatcher.dispatch("gambler", "!slotsoff 25:00", now).as_deref(),
            Some("@gambler, invalid time. Use HH:MM (e.g. 22:00)")
        );
        assert!(fx.dispatcher.dispatch("gambler", "!slotsoff whenever", now).is_some());
        assert_eq!(fx.session.autoplay_off_at(), None);
        assert_eq!(
            fx.dispatcher.dispatch("gambler", "!slotsoff", now).as_deref(),
            Some("@gambler, nothing scheduled. Use: !slotsoff <HH:MM> or !slotsoff <duration>")
        );
    }

    #[tokio::test]
    async fn dispatch__slotsoff_absurd_duration_gets_usage_reply() {
        // given
        let fx = fixture();

        // when
        let reply = fx
            .dispatcher
            .dispatch("bob", "!slotsoff 3000000000h", Instant::now());

        // then
        assert_eq!(
            reply.as_deref(),
            Some("@bob, use: !slotsoff <HH:MM> or !slotsoff <duration> (e.g. 2h, 30m, 1h30m)")
        );
        assert_eq!(fx.session.autoplay_off_at(), None);
    }

    #[tokio::test]
    async fn dispatch__owner_cannot_untrust_themselves() {
        let fx = fixture();
        let reply = fx.dispatcher.dispatch("gambler", "!untrust Gambler", Instant::now());
        assert_eq!(reply.as_deref(), Some("@gambler, you cannot remove yourself!"));
        assert!(fx.trusted.is_trusted("gambler"));
    }

    #[tokio::test]
    async fn dispatch__owner_manages_trust_list() {
        // given
        let fx = fixture();
        let now = Instant::now();

        // when
        let added = fx.dispatcher.dispatch("gambler", "!trust Carol", now);
        let again = fx.dispatcher.dispatch("gambler", "!trust carol", now);
        let self_add = fx.dispatcher.dispatch("gambler", "!trust gambler", now);
        let removed = fx.dispatcher.dispatch("gambler", "!untrust bob", now);
        let missing = fx.dispatcher.dispatch("gambler", "!untrust bob", now);
        let list = fx.dispatcher.dispatch("gambler", "!trustlist", now);

        // then
        assert_eq!(added.as_deref(), Some("@gambler, added carol to trusted users!"));
        assert_eq!(again.as_deref(), Some("@gambler, carol is already trusted"));
        assert_eq!(self_add.as_deref(), Some("@gambler, you cannot add yourself!"));
        assert_eq!(removed.as_deref(), Some("@gambler, removed bob from trusted users!"));
        assert_eq!(missing.as_deref(), Some("@gambler, bob is not a trusted user"));
        assert_eq!(list.as_deref(), Some("@gambler, trusted: carol"));
    }

    #[tokio::test]
    async fn dispatch__unknown_command_is_silent() {
        let fx = fixture();
        assert_eq!(fx.dispatcher.dispatch("gambler", "!dance", Instant::now()), None);
        assert!(!fx.dispatcher.is_internal_command("!dance"));
        assert!(fx.dispatcher.is_internal_command("!STATUS"));
    }
}
