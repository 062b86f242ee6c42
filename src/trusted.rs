use color_eyre::eyre::{
    Result,
    WrapErr,
};
use itertools::Itertools;
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    collections::HashSet,
    fs,
    io,
    path::{
        Path,
        PathBuf,
    },
    sync::{
        Mutex,
        MutexGuard,
        PoisonError,
    },
};
use tracing::{
    info,
    warn,
};

pub const TRUSTED_USERS_FILE: &str = "trusted_users.json";

/// Durable home of the trusted-user set.
pub trait TrustedUserStore: Send + Sync {
    fn load(&self) -> Result<HashSet<String>>;

    fn save(&self, users: &HashSet<String>) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TrustedUsersFile {
    users: Vec<String>,
}

/// `{"users": [...]}` on disk, replaced atomically on every save.
#[derive(Debug)]
pub struct JsonTrustedUserStore {
    path: PathBuf,
}

impl JsonTrustedUserStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The trusted-user file lives next to the env file.
    pub fn beside(env_path: impl AsRef<Path>) -> Self {
        let dir = env_path
            .as_ref()
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        Self::new(dir.join(TRUSTED_USERS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TrustedUserStore for JsonTrustedUserStore {
    fn load(&self) -> Result<HashSet<String>> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(HashSet::new()),
            Err(err) => {
                return Err(err).wrap_err_with(|| {
                    format!("Failed to read trusted users from {}", self.path.display())
                });
            }
        };
        let stored = serde_json::from_slice::<TrustedUsersFile>(&data)
            .wrap_err("Failed to parse trusted users JSON")?;
        Ok(stored.users.into_iter().collect())
    }

    fn save(&self, users: &HashSet<String>) -> Result<()> {
        let stored = TrustedUsersFile {
            users: users.iter().sorted().cloned().collect(),
        };
        let json = serde_json::to_vec_pretty(&stored)
            .wrap_err("Failed to serialize trusted users")?;
        write_atomically(&self.path, &json)
    }
}

/// Writes to a sibling temp file first so readers never see a partial file.
pub(crate) fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .wrap_err_with(|| format!("Failed to create directory {}", dir.display()))?;
    }
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));
    fs::write(&tmp_path, contents)
        .wrap_err_with(|| format!("Failed to write {}", tmp_path.display()))?;
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err).wrap_err_with(|| format!("Failed to replace {}", path.display()));
    }
    Ok(())
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TrustChange {
    Added,
    AlreadyTrusted,
    IsOwner,
    Removed,
    NotTrusted,
}

/// Users allowed to drive the bot from chat. The owner is always trusted and
/// never stored.
pub struct TrustedUsers {
    owner: String,
    users: Mutex<HashSet<String>>,
    store: Box<dyn TrustedUserStore>,
}

impl TrustedUsers {
    /// Loading never fails: an unreadable store starts an empty set.
    pub fn load(owner: &str, store: Box<dyn TrustedUserStore>) -> Self {
        let users = match store.load() {
            Ok(users) => users.into_iter().map(|u| u.to_lowercase()).collect(),
            Err(err) => {
                warn!(?err, "could not load trusted users, starting with none");
                HashSet::new()
            }
        };
        if users.is_empty() {
            if let Err(err) = store.save(&users) {
                warn!(?err, "could not save default trusted users");
            }
        }
        info!(count = users.len(), "trusted users loaded");
        Self {
            owner: owner.to_lowercase(),
            users: Mutex::new(users),
            store,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.users.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn is_owner(&self, user: &str) -> bool {
        user.to_lowercase() == self.owner
    }

    pub fn is_trusted(&self, user: &str) -> bool {
        self.is_owner(user) || self.lock().contains(&user.to_lowercase())
    }

    pub fn add(&self, user: &str) -> TrustChange {
        let user = user.to_lowercase();
        if user == self.owner {
            return TrustChange::IsOwner;
        }
        let mut users = self.lock();
        if !users.insert(user) {
            return TrustChange::AlreadyTrusted;
        }
        self.persist(&users);
        TrustChange::Added
    }

    pub fn remove(&self, user: &str) -> TrustChange {
        let user = user.to_lowercase();
        if user == self.owner {
            return TrustChange::IsOwner;
        }
        let mut users = self.lock();
        if !users.remove(&user) {
            return TrustChange::NotTrusted;
        }
        self.persist(&users);
        TrustChange::Removed
    }

    pub fn list(&self) -> Vec<String> {
        self.lock().iter().sorted().cloned().collect()
    }

    // Saved under the lock so concurrent mutations reach the store in order.
    fn persist(&self, users: &HashSet<String>) {
        if let Err(err) = self.store.save(users) {
            warn!(?err, "could not save trusted users");
        }
    }
}
