//! The orchestrator. One task consumes every inbound [`ChatEvent`]; timers and
//! outgoing sends run as their own tasks and share state through [`Session`],
//! [`Wallet`] and [`TrustedUsers`].

use crate::{
    autoplay::AutoplayScheduler,
    commands::{
        CommandDispatcher,
        extract_trusted_command,
    },
    config::ConfigStore,
    gambling::{
        BALANCE_COMMAND,
        HEIST_COMMAND,
        PaidCommand,
        SLOTS_COMMAND,
    },
    health::{
        BotStats,
        StatsProvider,
    },
    lifecycle::{
        ConnectError,
        ConnectionSupervisor,
    },
    parsing::{
        BotLine,
        classify_bot_line,
        reassemble_split,
    },
    sender::{
        RateLimitedSender,
        TokenBucket,
    },
    session::{
        CLEANUP_INTERVAL,
        Session,
        format_duration,
    },
    transport::{
        BanEvent,
        ChatEvent,
        ChatMessage,
        ChatTransport,
        EventSink,
        EventStream,
    },
    trusted::TrustedUsers,
    wallet::Wallet,
};
use std::{
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{
        self,
        Instant,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    error,
    info,
    warn,
};

/// Pause between the connect message and the balance query.
pub const GREETING_BALANCE_DELAY: Duration = Duration::from_secs(2);
/// Pause before resending after the service says we are too fast.
pub const NOTICE_RETRY_DELAY: Duration = Duration::from_secs(1);
const RATE_LIMIT_NOTICE_MARKERS: [&str; 3] = ["too quick", "rate", "slow mode"];

pub fn is_rate_limit_notice(message: &str) -> bool {
    let lower = message.to_lowercase();
    RATE_LIMIT_NOTICE_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}

pub struct Bot<T> {
    config: Arc<ConfigStore>,
    wallet: Arc<Wallet>,
    session: Arc<Session>,
    trusted: Arc<TrustedUsers>,
    transport: Arc<T>,
    sender: RateLimitedSender<T>,
    commands: CommandDispatcher,
    autoplay: Arc<AutoplayScheduler>,
    cancel: CancellationToken,
}

impl<T: ChatTransport> Bot<T> {
    pub fn new(
        config: Arc<ConfigStore>,
        transport: Arc<T>,
        trusted: TrustedUsers,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let cfg = config.config();
        let wallet = Arc::new(Wallet::new(0));
        let session = Arc::new(Session::new(cfg.auto_slots_enabled));
        let trusted = Arc::new(trusted);
        let autoplay = Arc::new(AutoplayScheduler::new(
            session.clone(),
            cfg.autoplay_interval(),
            cancel.clone(),
        ));
        let bucket = TokenBucket::new(cfg.bucket_size(), cfg.refill_interval());
        let sender = RateLimitedSender::new(transport.clone(), bucket);
        let commands = CommandDispatcher::new(
            config.clone(),
            wallet.clone(),
            session.clone(),
            trusted.clone(),
            autoplay.clone(),
        );
        Arc::new(Self {
            config,
            wallet,
            session,
            trusted,
            transport,
            sender,
            commands,
            autoplay,
            cancel,
        })
    }

    pub fn wallet(&self) -> &Wallet {
        &self.wallet
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn trusted(&self) -> &TrustedUsers {
        &self.trusted
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Keeps the send bucket topped up until the bot is cancelled. [`Bot::run`]
    /// does this itself.
    pub fn spawn_refiller(&self) -> JoinHandle<()> {
        self.sender.bucket().spawn_refiller(self.cancel.clone())
    }

    /// Starts the background tasks and processes inbound events until the
    /// cancellation token fires, the event stream ends or connecting fails for
    /// good. Every background task is stopped before this returns.
    pub async fn run(
        self: Arc<Self>,
        events: EventSink,
        mut inbound: EventStream,
    ) -> Result<(), ConnectError> {
        let cfg = self.config.config();
        let refiller = self.spawn_refiller();
        let (reconnect_tx, reconnect_rx) = mpsc::unbounded_channel();
        let supervisor = ConnectionSupervisor::new(self.transport.clone(), &cfg.channel, events)
            .with_max_attempts(cfg.max_connect_attempts);
        let mut supervisor_task = tokio::spawn(supervisor.run(reconnect_rx, self.cancel.clone()));
        let autoplay_task = tokio::spawn(self.clone().run_autoplay());
        let cleanup_task = tokio::spawn(self.clone().run_cleanup());
        info!(channel = %cfg.channel, username = %cfg.username, "bot started");

        let mut supervisor_result = None;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                joined = &mut supervisor_task => {
                    supervisor_result = Some(joined);
                    break;
                }
                event = inbound.recv() => match event {
                    Some(event) => self.handle_event(event, &reconnect_tx),
                    None => break,
                },
            }
        }

        self.cancel.cancel();
        let supervisor_result = match supervisor_result {
            Some(joined) => joined,
            None => supervisor_task.await,
        };
        for (name, task) in [
            ("refiller", refiller),
            ("autoplay", autoplay_task),
            ("cleanup", cleanup_task),
        ] {
            if let Err(err) = task.await {
                warn!(?err, task = name, "background task ended abnormally");
            }
        }
        info!("bot stopped");

        match supervisor_result {
            Ok(result) => result,
            Err(err) => match err.try_into_panic() {
                Ok(panic) => {
                    error!("connection supervisor panicked");
                    std::panic::resume_unwind(panic)
                }
                Err(err) => {
                    error!(?err, "connection supervisor was aborted");
                    Err(ConnectError::Cancelled)
                }
            },
        }
    }

    async fn run_autoplay(self: Arc<Self>) {
        let channel = self.config.config().channel.clone();
        self.autoplay
            .run(|| {
                let bot = self.clone();
                let channel = channel.clone();
                async move {
                    bot.say(&channel, SLOTS_COMMAND).await;
                }
            })
            .await;
    }

    async fn run_cleanup(self: Arc<Self>) {
        let mut ticker = time::interval(CLEANUP_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let purged = self.session.purge_stale_commands(Instant::now());
                    if purged > 0 {
                        debug!(purged, "purged stale command timestamps");
                    }
                }
            }
        }
    }

    fn handle_event(self: &Arc<Self>, event: ChatEvent, reconnect: &mpsc::UnboundedSender<()>) {
        match event {
            ChatEvent::Connected => self.on_connected(),
            ChatEvent::Message(message) => self.on_message(message),
            ChatEvent::Ban(ban) => self.on_ban(ban),
            ChatEvent::ReconnectRequested => {
                let status = self.session.track_reconnect(Instant::now());
                if status.high_frequency {
                    error!(count = status.count, "high reconnect frequency");
                } else {
                    warn!(count = status.count, "reconnect requested");
                }
                let _ = reconnect.send(());
            }
            ChatEvent::Disconnected { reason } => {
                warn!(%reason, "disconnected");
                let _ = reconnect.send(());
            }
            ChatEvent::Notice { channel, message } => self.on_notice(channel, message),
        }
    }

    fn on_connected(self: &Arc<Self>) {
        let cfg = self.config.config();
        if !self.session.begin_greeting(cfg.greet_on_reconnect) {
            return;
        }
        let bot = self.clone();
        tokio::spawn(async move {
            let cfg = bot.config.config();
            bot.say(&cfg.channel, &cfg.connect_message).await;
            tokio::select! {
                _ = bot.cancel.cancelled() => return,
                _ = time::sleep(GREETING_BALANCE_DELAY) => {}
            }
            bot.say(&cfg.channel, BALANCE_COMMAND).await;
        });
    }

    fn on_message(self: &Arc<Self>, message: ChatMessage) {
        self.session.record_received();
        debug!(
            channel = %message.channel,
            user = %message.user_name,
            text = %message.text,
            "chat message"
        );
        let cfg = self.config.config();

        if message.user_name.eq_ignore_ascii_case(&cfg.boss_bot_name) {
            self.on_boss_line(&message);
            return;
        }

        if !self.trusted.is_trusted(&message.user_name) {
            return;
        }
        let Some(line) = extract_trusted_command(&message.text, &cfg.username, &cfg.prefix)
        else {
            return;
        };
        if let Some(reply) = self
            .commands
            .dispatch(&message.user_name, &line, Instant::now())
        {
            self.spawn_say(message.channel, reply);
        }
    }

    fn on_boss_line(self: &Arc<Self>, message: &ChatMessage) {
        let cfg = self.config.config();
        let now = Instant::now();
        let pending = self.session.take_pending_split(now);
        let text = reassemble_split(&message.text, pending);

        match classify_bot_line(&text, &cfg.username) {
            BotLine::Balance(Some(bombs)) => {
                self.wallet.set_balance(bombs);
                info!(bombs, "balance updated");
            }
            BotLine::Slots(Some(outcome)) => {
                if outcome.delta != 0 {
                    self.wallet.add_balance(outcome.delta);
                }
                self.session.record_autoplay(now);
                info!(outcome = %outcome.tag, bombs = self.wallet.balance(), "slots result");
            }
            BotLine::HeistPayout(Some(payout)) => {
                self.wallet.add_balance(payout);
                info!(payout, bombs = self.wallet.balance(), "heist finished");
            }
            BotLine::ArenaPayout(Some(payout)) => {
                self.wallet.add_balance(payout);
                info!(payout, bombs = self.wallet.balance(), "arena finished");
            }
            BotLine::Points(Some(points)) => {
                if cfg.points_as_delta {
                    self.wallet.add_balance(points);
                } else {
                    self.wallet.set_balance(points);
                }
                info!(points, bombs = self.wallet.balance(), "points announced");
            }
            BotLine::Balance(None)
            | BotLine::Slots(None)
            | BotLine::HeistPayout(None)
            | BotLine::ArenaPayout(None)
            | BotLine::Points(None) => debug!(%text, "could not parse minigame announcement"),
            BotLine::SplitStart => {
                self.session.store_pending_split(&text, now);
                debug!(%text, "buffering split announcement");
            }
            BotLine::Cooldown => warn!(%text, "minigame reports cooldown"),
            BotLine::InsufficientFunds => warn!(%text, "minigame reports not enough bombs"),
            BotLine::Other => self.auto_respond(&message.channel, &text),
        }
    }

    fn auto_respond(self: &Arc<Self>, channel: &str, text: &str) {
        let Some(auto) = self
            .config
            .auto_responses()
            .iter()
            .find(|auto| text.contains(&auto.trigger))
        else {
            return;
        };
        let response = if auto.response == HEIST_COMMAND {
            format!("{HEIST_COMMAND} {}", self.config.default_heist())
        } else {
            auto.response.clone()
        };
        debug!(trigger = %auto.trigger, %response, "auto response");
        self.spawn_say(channel.to_string(), response);
    }

    fn on_ban(self: &Arc<Self>, ban: BanEvent) {
        let cfg = self.config.config();
        info!(channel = %ban.channel, user = %ban.user_name, permanent = ban.is_permanent(), "ban");
        let same_channel = ban
            .channel
            .trim_start_matches('#')
            .eq_ignore_ascii_case(cfg.channel.trim_start_matches('#'));
        if same_channel && ban.is_permanent() && cfg.band_on_perma && !cfg.band_message.is_empty() {
            self.spawn_say(ban.channel, cfg.band_message.clone());
        }
    }

    fn on_notice(self: &Arc<Self>, channel: String, message: String) {
        if !is_rate_limit_notice(&message) {
            debug!(%channel, %message, "notice");
            return;
        }
        warn!(%channel, %message, "rate limited by the service, retrying last message");
        let bot = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = bot.cancel.cancelled() => return,
                _ = time::sleep(NOTICE_RETRY_DELAY) => {}
            }
            if let Some(last) = bot.session.last_sent() {
                bot.send(&channel, &last).await;
            }
        });
    }

    fn spawn_say(self: &Arc<Self>, channel: String, message: String) {
        let bot = self.clone();
        tokio::spawn(async move {
            bot.say(&channel, &message).await;
        });
    }

    /// Sends `message`, first paying for it if it is one of the minigame
    /// commands. Returns whether it went out.
    pub async fn say(&self, channel: &str, message: &str) -> bool {
        let message = message.trim();
        if message.is_empty() {
            return false;
        }

        let Some(paid) = PaidCommand::detect(message, self.config.default_heist()) else {
            return self.send(channel, message).await;
        };
        let paid = match paid {
            Ok(paid) => paid,
            Err(err) => {
                warn!(%err, %message, "not sending invalid heist");
                return false;
            }
        };

        let cost = paid.cost(&self.config.config().costs());
        if !self.wallet.spend(cost) {
            warn!(
                command = %paid.message(),
                cost,
                bombs = self.wallet.balance(),
                "not enough bombs, skipping"
            );
            return false;
        }
        info!(command = %paid.message(), cost, bombs = self.wallet.balance(), "paid for command");

        let sent = self.send(channel, &paid.message()).await;
        if !sent {
            self.wallet.add_balance(cost);
        }
        sent
    }

    /// Rate-limited send with no cost handling.
    async fn send(&self, channel: &str, message: &str) -> bool {
        match self.sender.say(channel, message, &self.cancel).await {
            Ok(()) => {
                self.session.record_sent(message);
                info!(%channel, %message, "sent");
                true
            }
            Err(err) => {
                warn!(?err, %channel, %message, "message dropped");
                false
            }
        }
    }

    /// Runs a line typed on the local console as the owner: one of our
    /// commands is dispatched, anything else goes to the channel.
    pub async fn execute_command(&self, line: &str) -> bool {
        let cfg = self.config.config();
        let line = line.trim();
        if self.commands.is_internal_command(line) {
            let reply = self.commands.dispatch(&cfg.username, line, Instant::now());
            return match reply {
                Some(reply) => self.say(&cfg.channel, &reply).await,
                None => false,
            };
        }
        self.say(&cfg.channel, line).await
    }

    pub fn stats(&self) -> BotStats {
        let cfg = self.config.config();
        let uptime = self.session.uptime();
        let counters = self.session.counters();
        BotStats {
            status: "ok".to_string(),
            uptime: format_duration(uptime),
            uptime_seconds: uptime.as_secs(),
            bombs: self.wallet.balance(),
            messages_sent: counters.messages_sent,
            messages_received: counters.messages_received,
            reconnect_count: counters.reconnects,
            channel: cfg.channel.clone(),
            username: cfg.username.clone(),
        }
    }
}

impl<T: ChatTransport> StatsProvider for Bot<T> {
    fn stats(&self) -> BotStats {
        Bot::stats(self)
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::test_helpers::{
        TestBot,
        test_config,
    };

    #[test]
    fn is_rate_limit_notice__matches_known_phrases() {
        assert!(is_rate_limit_notice("You are sending messages too quickly."));
        assert!(is_rate_limit_notice("This room is in Slow Mode"));
        assert!(is_rate_limit_notice("Rate limit exceeded"));
        assert!(!is_rate_limit_notice("Welcome to the channel"));
    }

    #[tokio::test(start_paused = true)]
    async fn say__charges_wallet_and_normalises_heist() {
        // given
        let test_bot = TestBot::idle(test_config(), &[]);
        test_bot.bot.wallet().set_balance(5_000);

        // when
        let sent = test_bot.bot.say("stream", "  !heist 20000 ").await;

        // then
        assert!(!sent);
        assert_eq!(test_bot.bot.wallet().balance(), 5_000);
        test_bot.bot.wallet().set_balance(20_000);
        assert!(test_bot.bot.say("stream", "!heist 20000").await);
        assert_eq!(test_bot.bot.wallet().balance(), 10_000);
        assert_eq!(test_bot.transport.sent_texts(), vec!["!heist 10000".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn say__suppresses_unaffordable_command() {
        // given
        let test_bot = TestBot::idle(test_config(), &[]);
        test_bot.bot.wallet().set_balance(1_999);

        // when
        let sent = test_bot.bot.say("stream", "!slots").await;

        // then
        assert!(!sent);
        assert_eq!(test_bot.bot.wallet().balance(), 1_999);
        assert!(test_bot.transport.sent_texts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn say__rejects_non_positive_heist_and_ignores_blank() {
        let test_bot = TestBot::idle(test_config(), &[]);
        test_bot.bot.wallet().set_balance(5_000);
        assert!(!test_bot.bot.say("stream", "!heist 0").await);
        assert!(!test_bot.bot.say("stream", "   ").await);
        assert_eq!(test_bot.bot.wallet().balance(), 5_000);
        assert!(test_bot.transport.sent_texts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn say__refunds_when_send_fails() {
        // given
        let test_bot = TestBot::idle(test_config(), &[]);
        test_bot.bot.wallet().set_balance(5_000);
        test_bot.transport.set_connected(false);

        // when
        let sent = test_bot.bot.say("stream", "!slots").await;

        // then
        assert!(!sent);
        assert_eq!(test_bot.bot.wallet().balance(), 5_000);
    }

    #[tokio::test(start_paused = true)]
    async fn say__records_last_message_and_counter() {
        let test_bot = TestBot::idle(test_config(), &[]);
        assert!(test_bot.bot.say("stream", "hello chat").await);
        assert_eq!(test_bot.bot.session().last_sent().as_deref(), Some("hello chat"));
        assert_eq!(test_bot.bot.stats().messages_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn execute_command__dispatches_internal_and_forwards_other_lines() {
        // given
        let test_bot = TestBot::idle(test_config(), &[]);
        test_bot.bot.wallet().set_balance(3_000);

        // when
        test_bot.bot.execute_command("!getheist").await;
        test_bot.bot.execute_command("!slots").await;

        // then
        assert_eq!(
            test_bot.transport.sent_texts(),
            vec!["@gambler, current heist is 1000".to_string(), "!slots".to_string()]
        );
        assert_eq!(test_bot.bot.wallet().balance(), 1_000);
    }

    #[tokio::test(start_paused = true)]
    async fn stats__reports_counters_and_identity() {
        // given
        let test_bot = TestBot::idle(test_config(), &[]);
        test_bot.bot.wallet().set_balance(42);
        time::sleep(Duration::from_secs(65)).await;

        // when
        let stats = test_bot.bot.stats();

        // then
        assert_eq!(stats.status, "ok");
        assert_eq!(stats.bombs, 42);
        assert_eq!(stats.uptime, "1m5s");
        assert_eq!(stats.uptime_seconds, 65);
        assert_eq!(stats.channel, "stream");
        assert_eq!(stats.username, "gambler");
    }
}
