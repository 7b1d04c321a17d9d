//! Durable player profile: display name, server-issued player id and the
//! current level token. Survives restarts, unlike the session id.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("unable to determine home directory")]
    NoHome,
    #[error("profile io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("profile file is malformed: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("profile could not be serialized: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerProfile {
    pub username: String,
    #[serde(default)]
    pub player_id: Option<String>,
    pub level: String,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl PlayerProfile {
    pub fn new(username: impl Into<String>, player_id: Option<String>, level: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            player_id,
            level: level.into(),
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self.updated_at = OffsetDateTime::now_utc();
        self
    }
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn load(&self) -> Result<Option<PlayerProfile>, ProfileError>;

    async fn save(&self, profile: &PlayerProfile) -> Result<(), ProfileError>;

    async fn clear(&self) -> Result<(), ProfileError>;
}

/// TOML file under the user's home directory.
#[derive(Debug, Clone)]
pub struct FileProfileStore {
    path: PathBuf,
}

impl FileProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_path() -> Result<PathBuf, ProfileError> {
        let base = BaseDirs::new().ok_or(ProfileError::NoHome)?;
        Ok(base.home_dir().join(".puzzle-quest").join("profile.toml"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> ProfileError {
        ProfileError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl ProfileStore for FileProfileStore {
    async fn load(&self) -> Result<Option<PlayerProfile>, ProfileError> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(self.io_error(err)),
        };
        Ok(Some(toml::from_str(&raw)?))
    }

    async fn save(&self, profile: &PlayerProfile) -> Result<(), ProfileError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| self.io_error(err))?;
        }

        let serialized = toml::to_string_pretty(profile)?;
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options
            .open(&self.path)
            .await
            .map_err(|err| self.io_error(err))?;
        file.write_all(serialized.as_bytes())
            .await
            .map_err(|err| self.io_error(err))?;
        // tokio files finish writes in the background until flushed
        file.flush().await.map_err(|err| self.io_error(err))?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), ProfileError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(self.io_error(err)),
        }
    }
}

/// In-memory adapter for tests.
#[derive(Debug, Default)]
pub struct MemoryProfileStore {
    profile: Mutex<Option<PlayerProfile>>,
}

impl MemoryProfileStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_profile(profile: PlayerProfile) -> Arc<Self> {
        Arc::new(Self {
            profile: Mutex::new(Some(profile)),
        })
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn load(&self) -> Result<Option<PlayerProfile>, ProfileError> {
        Ok(self.profile.lock().await.clone())
    }

    async fn save(&self, profile: &PlayerProfile) -> Result<(), ProfileError> {
        *self.profile.lock().await = Some(profile.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), ProfileError> {
        self.profile.lock().await.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_store_round_trips_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileProfileStore::new(dir.path().join("nested").join("profile.toml"));
        assert!(store.load().await.unwrap().is_none());

        let profile = PlayerProfile::new("Alice", Some("p-1".into()), "level_2");
        store.save(&profile).await.unwrap();
        let loaded = store.load().await.unwrap().expect("profile");
        assert_eq!(loaded.username, "Alice");
        assert_eq!(loaded.player_id.as_deref(), Some("p-1"));
        assert_eq!(loaded.level, "level_2");

        store.clear().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
        // clearing twice is fine
        store.clear().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_store_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = FileProfileStore::new(dir.path().join("profile.toml"));
        store
            .save(&PlayerProfile::new("Bob", None, "level_1"))
            .await
            .unwrap();
        let mode = std::fs::metadata(store.path())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn malformed_file_reports_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.toml");
        std::fs::write(&path, "username = ").unwrap();
        let err = FileProfileStore::new(path).load().await.unwrap_err();
        assert!(matches!(err, ProfileError::Parse(_)));
    }

    #[tokio::test]
    async fn unreadable_path_reports_io_error() {
        let dir = tempfile::tempdir().unwrap();
        // a directory where the file should be
        let store = FileProfileStore::new(dir.path());
        match store.load().await {
            Err(ProfileError::Io { path, .. }) => assert_eq!(path, dir.path()),
            other => panic!("expected an io error, got {other:?}"),
        }
        assert!(store
            .save(&PlayerProfile::new("Alice", None, "level_1"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn memory_store_keeps_latest_level() {
        let store = MemoryProfileStore::new();
        let profile = PlayerProfile::new("Alice", None, "level_1");
        store.save(&profile).await.unwrap();
        store.save(&profile.with_level("level_3")).await.unwrap();
        assert_eq!(store.load().await.unwrap().unwrap().level, "level_3");
    }
}
