//! In-memory stand-ins for the chat service and the durable stores, plus a
//! harness that wires them into a [`Bot`].

use crate::{
    bot::Bot,
    config::{
        BotConfig,
        ConfigStore,
        ConfigWriter,
        DEFAULT_ENV_PATH,
    },
    gambling::{
        DEFAULT_ARENA_COST,
        DEFAULT_HEIST,
        DEFAULT_SLOTS_COST,
    },
    lifecycle::ConnectError,
    transport::{
        ChatEvent,
        ChatMessage,
        ChatTransport,
        EventSink,
        EventStream,
        TransportError,
    },
    trusted::{
        TrustedUserStore,
        TrustedUsers,
    },
};
use color_eyre::eyre::{
    Result,
    eyre,
};
use std::{
    collections::HashSet,
    path::PathBuf,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
    },
    time::Duration,
};
use tokio::{
    sync::{
        mpsc,
        watch,
    },
    task::{
        JoinError,
        JoinHandle,
    },
    time,
};
use tokio_util::sync::CancellationToken;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Polls `condition` every 10ms for up to a second of (possibly paused) time.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub fn test_config() -> BotConfig {
    BotConfig {
        username: "gambler".to_string(),
        oauth: "oauth:test".to_string(),
        channel: "stream".to_string(),
        prefix: "!".to_string(),
        status_command: "status".to_string(),
        connect_message: "!pyk".to_string(),
        boss_bot_name: "demonzzbot".to_string(),
        heist_amount: DEFAULT_HEIST,
        slots_cost: DEFAULT_SLOTS_COST,
        arena_cost: DEFAULT_ARENA_COST,
        auto_slots_enabled: false,
        auto_slots_interval: 15,
        band_on_perma: false,
        band_message: "BAND".to_string(),
        points_as_delta: true,
        say_bucket_size: 20,
        say_refill_ms: 150,
        greet_on_reconnect: false,
        log_level: "info".to_string(),
        log_dir: None,
        health_port: 0,
        trusted_users_path: None,
        auto_responses: None,
        max_connect_attempts: 0,
        env_path: PathBuf::from(DEFAULT_ENV_PATH),
    }
}

#[derive(Debug, Default)]
struct TransportState {
    disconnected: bool,
    failing_connects: u32,
    panic_on_connect: bool,
    connect_calls: u32,
    joined: Vec<String>,
    sent: Vec<(String, String)>,
}

/// Records everything the bot says. Starts out connected.
#[derive(Debug)]
pub struct RecordingTransport {
    state: Mutex<TransportState>,
    sent_count: watch::Sender<usize>,
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self {
            state: Mutex::default(),
            sent_count: watch::Sender::new(0),
        }
    }
}

impl RecordingTransport {
    pub fn set_connected(&self, connected: bool) {
        lock(&self.state).disconnected = !connected;
    }

    pub fn is_connected(&self) -> bool {
        !lock(&self.state).disconnected
    }

    /// The next `count` calls to `connect` fail.
    pub fn fail_next_connects(&self, count: u32) {
        lock(&self.state).failing_connects = count;
    }

    /// The next call to `connect` panics.
    pub fn panic_on_connect(&self) {
        lock(&self.state).panic_on_connect = true;
    }

    pub fn connect_calls(&self) -> u32 {
        lock(&self.state).connect_calls
    }

    pub fn joined(&self) -> Vec<String> {
        lock(&self.state).joined.clone()
    }

    /// `(channel, text)` pairs in send order.
    pub fn sent(&self) -> Vec<(String, String)> {
        lock(&self.state).sent.clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        lock(&self.state)
            .sent
            .iter()
            .map(|(_, text)| text.clone())
            .collect()
    }

    /// Resolves once at least `count` messages have gone out.
    pub async fn wait_for_sent(&self, count: usize) -> Vec<String> {
        let mut rx = self.sent_count.subscribe();
        let _ = rx.wait_for(|sent| *sent >= count).await;
        self.sent_texts()
    }
}

impl ChatTransport for RecordingTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let panic = std::mem::take(&mut lock(&self.state).panic_on_connect);
        if panic {
            panic!("transport blew up");
        }
        let mut state = lock(&self.state);
        state.connect_calls += 1;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(TransportError::Io("connection refused".to_string()));
        }
        state.disconnected = false;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        lock(&self.state).disconnected = true;
        Ok(())
    }

    fn join(&self, channel: &str) {
        lock(&self.state).joined.push(channel.to_string());
    }

    async fn say(&self, channel: &str, message: &str) -> Result<(), TransportError> {
        let sent = {
            let mut state = lock(&self.state);
            if state.disconnected {
                return Err(TransportError::Disconnected);
            }
            state.sent.push((channel.to_string(), message.to_string()));
            state.sent.len()
        };
        self.sent_count.send_replace(sent);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct TrustedStoreState {
    users: HashSet<String>,
    save_count: usize,
    fail_saves: bool,
}

/// Clones share the same contents.
#[derive(Clone, Debug, Default)]
pub struct MemoryTrustedUserStore {
    state: Arc<Mutex<TrustedStoreState>>,
}

impl MemoryTrustedUserStore {
    pub fn with_users(users: &[&str]) -> Self {
        let store = Self::default();
        lock(&store.state).users = users.iter().map(|user| user.to_lowercase()).collect();
        store
    }

    pub fn save_count(&self) -> usize {
        lock(&self.state).save_count
    }

    /// Sorted.
    pub fn users(&self) -> Vec<String> {
        let mut users: Vec<_> = lock(&self.state).users.iter().cloned().collect();
        users.sort();
        users
    }

    pub fn fail_saves(&self, fail: bool) {
        lock(&self.state).fail_saves = fail;
    }
}

impl TrustedUserStore for MemoryTrustedUserStore {
    fn load(&self) -> Result<HashSet<String>> {
        Ok(lock(&self.state).users.clone())
    }

    fn save(&self, users: &HashSet<String>) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail_saves {
            return Err(eyre!("disk full"));
        }
        state.users = users.clone();
        state.save_count += 1;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ConfigWriterState {
    fail: bool,
    last_persisted: Option<i64>,
}

#[derive(Clone, Debug, Default)]
pub struct MemoryConfigWriter {
    state: Arc<Mutex<ConfigWriterState>>,
}

impl MemoryConfigWriter {
    pub fn fail(&self, fail: bool) {
        lock(&self.state).fail = fail;
    }

    pub fn last_persisted(&self) -> Option<i64> {
        lock(&self.state).last_persisted
    }
}

impl ConfigWriter for MemoryConfigWriter {
    fn persist_heist(&self, amount: i64) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail {
            return Err(eyre!("read-only file system"));
        }
        state.last_persisted = Some(amount);
        Ok(())
    }
}

/// A [`Bot`] over a [`RecordingTransport`]. Dropping it cancels the bot.
pub struct TestBot {
    pub bot: Arc<Bot<RecordingTransport>>,
    pub transport: Arc<RecordingTransport>,
    pub trusted_store: MemoryTrustedUserStore,
    pub config_writer: MemoryConfigWriter,
    events: EventSink,
    task: Option<JoinHandle<Result<(), ConnectError>>>,
}

impl TestBot {
    fn build(config: BotConfig, trusted: &[&str]) -> (Self, EventStream) {
        let transport = Arc::new(RecordingTransport::default());
        let trusted_store = MemoryTrustedUserStore::with_users(trusted);
        let config_writer = MemoryConfigWriter::default();
        let owner = config.username.clone();
        let config = ConfigStore::new(config, Box::new(config_writer.clone()))
            .expect("test config is valid");
        let trusted_users = TrustedUsers::load(&owner, Box::new(trusted_store.clone()));
        let bot = Bot::new(
            Arc::new(config),
            transport.clone(),
            trusted_users,
            CancellationToken::new(),
        );
        let (events, inbound) = mpsc::unbounded_channel();
        let test_bot = Self {
            bot,
            transport,
            trusted_store,
            config_writer,
            events,
            task: None,
        };
        (test_bot, inbound)
    }

    /// The bot's event loop is not running; only the send bucket is refilled,
    /// so `say` and `execute_command` can be called directly.
    pub fn idle(config: BotConfig, trusted: &[&str]) -> Self {
        let (test_bot, _inbound) = Self::build(config, trusted);
        test_bot.bot.spawn_refiller();
        test_bot
    }

    /// Runs the full bot in the background. It connects, greets and then
    /// reacts to whatever is pushed with [`TestBot::push`].
    pub fn running(config: BotConfig, trusted: &[&str]) -> Self {
        let (mut test_bot, inbound) = Self::build(config, trusted);
        let bot = test_bot.bot.clone();
        let events = test_bot.events.clone();
        test_bot.task = Some(tokio::spawn(bot.run(events, inbound)));
        test_bot
    }

    pub fn push(&self, event: ChatEvent) {
        let _ = self.events.send(event);
    }

    /// A chat line from `user` in the bot's channel.
    pub fn chat(&self, user: &str, text: &str) {
        let channel = self.bot.config().config().channel.clone();
        self.push(ChatEvent::Message(ChatMessage::new(channel, user, text)));
    }

    /// A chat line from the minigame bot.
    pub fn announce(&self, text: &str) {
        let boss = self.bot.config().config().boss_bot_name.clone();
        self.chat(&boss, text);
    }

    /// Cancels the bot and returns what its run loop returned.
    pub async fn shutdown(self) -> Result<(), ConnectError> {
        self.join().await.expect("bot task panicked")
    }

    /// Like [`TestBot::shutdown`], but hands back a panic instead of
    /// propagating it.
    pub async fn join(mut self) -> Result<Result<(), ConnectError>, JoinError> {
        self.bot.cancel_token().cancel();
        match self.task.take() {
            Some(task) => task.await,
            None => Ok(Ok(())),
        }
    }
}

impl Drop for TestBot {
    fn drop(&mut self) {
        self.bot.cancel_token().cancel();
    }
}
