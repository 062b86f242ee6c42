use crate::{
    gambling::{
        Costs,
        DEFAULT_ARENA_COST,
        DEFAULT_HEIST,
        DEFAULT_SLOTS_COST,
    },
    sender::DEFAULT_BUCKET_SIZE,
    trusted::write_atomically,
};
use clap::{
    ArgAction,
    Parser,
    builder::BoolishValueParser,
};
use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    collections::BTreeMap,
    fs,
    io,
    path::{
        Path,
        PathBuf,
    },
    sync::{
        PoisonError,
        RwLock,
    },
    time::Duration,
};
use tracing::{
    debug,
    info,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
const HEIST_ENV_KEY: &str = "HEIST_AMOUNT";

#[derive(Parser, Clone, Debug)]
#[command(version, about = "Plays a chat channel's gambling minigame for you", long_about = None)]
pub struct BotConfig {
    /// Chat account the bot logs in as; also the owner identity
    #[arg(long, env = "TWITCH_USERNAME")]
    pub username: String,

    #[arg(long, env = "TWITCH_OAUTH", hide_env_values = true)]
    pub oauth: String,

    #[arg(long, env = "TWITCH_CHANNEL")]
    pub channel: String,

    #[arg(long, env = "COMMAND_PREFIX", default_value = "!")]
    pub prefix: String,

    /// Name of the status command, without prefix
    #[arg(long, env = "STATUS_COMMAND", default_value = "status")]
    pub status_command: String,

    #[arg(long, env = "CONNECT_MESSAGE", default_value = "!pyk")]
    pub connect_message: String,

    /// The minigame bot whose announcements we parse
    #[arg(long, env = "BOSS_BOT_NAME", default_value = "demonzzbot")]
    pub boss_bot_name: String,

    #[arg(long, env = "HEIST_AMOUNT", default_value_t = DEFAULT_HEIST)]
    pub heist_amount: i64,

    #[arg(long, env = "SLOTS_COST", default_value_t = DEFAULT_SLOTS_COST)]
    pub slots_cost: i64,

    #[arg(long, env = "ARENA_COST", default_value_t = DEFAULT_ARENA_COST)]
    pub arena_cost: i64,

    #[arg(long, env = "AUTO_SLOTS_ENABLED", default_value_t = false, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub auto_slots_enabled: bool,

    /// Minutes between automatic slot plays
    #[arg(long, env = "AUTO_SLOTS_INTERVAL", default_value_t = 15, value_parser = clap::value_parser!(u64).range(1..))]
    pub auto_slots_interval: u64,

    /// Say `band_message` when the channel hands out a permanent ban
    #[arg(long, env = "BAND_ON_PERMA", default_value_t = false, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub band_on_perma: bool,

    #[arg(long, env = "BAND_MESSAGE", default_value = "BAND")]
    pub band_message: String,

    /// Treat bare `name (points)` announcements as deltas instead of totals
    #[arg(long, env = "POINTS_AS_DELTA", default_value_t = true, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub points_as_delta: bool,

    #[arg(long, env = "SAY_BUCKET_SIZE", default_value_t = DEFAULT_BUCKET_SIZE as u64, value_parser = clap::value_parser!(u64).range(1..))]
    pub say_bucket_size: u64,

    #[arg(long, env = "SAY_REFILL_MS", default_value_t = 150, value_parser = clap::value_parser!(u64).range(1..))]
    pub say_refill_ms: u64,

    #[arg(long, env = "GREET_ON_RECONNECT", default_value_t = false, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub greet_on_reconnect: bool,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Also write daily rolling log files here
    #[arg(long, env = "LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Port of the `/health` endpoint; 0 disables it
    #[arg(long, env = "HEALTH_PORT", default_value_t = 0)]
    pub health_port: u16,

    #[arg(long, env = "TRUSTED_USERS_PATH")]
    pub trusted_users_path: Option<PathBuf>,

    /// JSON object of trigger phrase -> response, replacing the defaults
    #[arg(long, env = "AUTO_RESPONSES")]
    pub auto_responses: Option<String>,

    /// Give up connecting after this many attempts; 0 retries forever
    #[arg(long, env = "MAX_CONNECT_ATTEMPTS", default_value_t = 0)]
    pub max_connect_attempts: u32,

    #[arg(long, env = "ENV_PATH", default_value = DEFAULT_ENV_PATH)]
    pub env_path: PathBuf,
}

impl BotConfig {
    pub fn costs(&self) -> Costs {
        Costs {
            slots: self.slots_cost,
            arena: self.arena_cost,
        }
    }

    pub fn autoplay_interval(&self) -> Duration {
        Duration::from_secs(self.auto_slots_interval * 60)
    }

    pub fn bucket_size(&self) -> usize {
        usize::try_from(self.say_bucket_size).unwrap_or(usize::MAX)
    }

    pub fn refill_interval(&self) -> Duration {
        Duration::from_millis(self.say_refill_ms)
    }

    pub fn env_path(&self) -> PathBuf {
        expand_path(&self.env_path)
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.log_dir.as_deref().map(expand_path)
    }

    pub fn trusted_users_path(&self) -> Option<PathBuf> {
        self.trusted_users_path.as_deref().map(expand_path)
    }
}

pub fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned())
}

/// Loads `ENV_PATH` (or `./.env`) into the process environment before the
/// command line is parsed. A missing file is fine.
pub fn load_env_file() -> Result<Option<PathBuf>> {
    let raw = std::env::var("ENV_PATH").unwrap_or_else(|_| DEFAULT_ENV_PATH.to_string());
    let path = expand_path(Path::new(&raw));
    match dotenvy::from_path(&path) {
        Ok(()) => Ok(Some(path)),
        Err(err) if err.not_found() => {
            debug!(path = %path.display(), "no env file");
            Ok(None)
        }
        Err(err) => Err(err).wrap_err_with(|| format!("Failed to load {}", path.display())),
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AutoResponse {
    pub trigger: String,
    pub response: String,
}

impl AutoResponse {
    pub fn new(trigger: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            trigger: trigger.into(),
            response: response.into(),
        }
    }
}

pub fn default_auto_responses() -> Vec<AutoResponse> {
    vec![
        AutoResponse::new("Type !boss to start!", "!boss"),
        AutoResponse::new("Type !boss to join!", "!boss"),
        AutoResponse::new("Type !ffa to start!", "!ffa"),
        AutoResponse::new("!los", "!los"),
        AutoResponse::new(
            "The cops have given up! If you want to get a team together type !heist",
            "!heist",
        ),
    ]
}

/// Overrides come in as a JSON object and are matched in key order.
pub fn parse_auto_responses(raw: Option<&str>) -> Result<Vec<AutoResponse>> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Ok(default_auto_responses());
    };
    let map = serde_json::from_str::<BTreeMap<String, String>>(raw)
        .wrap_err("AUTO_RESPONSES must be a JSON object of trigger -> response")?;
    Ok(map
        .into_iter()
        .map(|(trigger, response)| AutoResponse { trigger, response })
        .collect())
}

/// Durable side of the one setting chat users can change.
pub trait ConfigWriter: Send + Sync {
    fn persist_heist(&self, amount: i64) -> Result<()>;
}

/// Rewrites (or appends) `HEIST_AMOUNT=<n>` in the env file.
#[derive(Debug)]
pub struct EnvFileWriter {
    path: PathBuf,
}

impl EnvFileWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigWriter for EnvFileWriter {
    fn persist_heist(&self, amount: i64) -> Result<()> {
        let existing = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
            Err(err) => {
                return Err(err)
                    .wrap_err_with(|| format!("Failed to read {}", self.path.display()));
            }
        };
        let content = upsert_env_line(&existing, HEIST_ENV_KEY, &amount.to_string());
        write_atomically(&self.path, content.as_bytes())
    }
}

fn upsert_env_line(existing: &str, key: &str, value: &str) -> String {
    let prefix = format!("{key}=");
    let replacement = format!("{key}={value}");
    let mut found = false;
    let mut lines: Vec<String> = existing
        .lines()
        .map(|line| {
            if line.starts_with(&prefix) {
                found = true;
                replacement.clone()
            } else {
                line.to_string()
            }
        })
        .collect();
    if !found {
        lines.push(replacement);
    }
    let mut content = lines.join("\n");
    content.push('\n');
    content
}

/// Static configuration plus the live default heist.
pub struct ConfigStore {
    config: BotConfig,
    auto_responses: Vec<AutoResponse>,
    default_heist: RwLock<i64>,
    writer: Box<dyn ConfigWriter>,
}

impl ConfigStore {
    pub fn new(config: BotConfig, writer: Box<dyn ConfigWriter>) -> Result<Self> {
        if config.prefix.trim().is_empty() {
            return Err(eyre!("COMMAND_PREFIX must not be empty"));
        }
        let auto_responses = parse_auto_responses(config.auto_responses.as_deref())?;
        info!(
            channel = %config.channel,
            username = %config.username,
            auto_responses = auto_responses.len(),
            "configuration loaded"
        );
        Ok(Self {
            default_heist: RwLock::new(config.heist_amount),
            config,
            auto_responses,
            writer,
        })
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    pub fn auto_responses(&self) -> &[AutoResponse] {
        &self.auto_responses
    }

    pub fn default_heist(&self) -> i64 {
        *self.default_heist.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// The new amount is live immediately; the returned error only reports
    /// that it was not persisted.
    pub fn update_heist(&self, amount: i64) -> Result<()> {
        *self.default_heist.write().unwrap_or_else(PoisonError::into_inner) = amount;
        self.writer.persist_heist(amount)
    }
}
