use std::path::{Path, PathBuf};

use fs2::FileExt;
use tokio::fs;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::identity::TokenCacheEntry;
use crate::store::TokenStore;

/// Sub-cache suffixes an identity key may own next to its main entry.
/// `Invalidate` clears all of them.
const SUB_CACHES: &[&str] = &["user", "device", "title", "msal", "xbl"];

/// File-based token store.
///
/// One directory (mode 0700) holding one JSON file per identity key
/// (mode 0600), plus optional sub-cache files for intermediate tokens:
///
/// ```text
/// ./auth/
/// ├── lock                      # advisory lock
/// ├── 3f2a…9c.json              # main bundle for one (email, title)
/// ├── 3f2a…9c.user.json         # cached XASU user token
/// └── 3f2a…9c.device.json       # cached XASD device token
/// ```
///
/// Writes are write-temp-then-rename so a concurrent reader never sees a
/// half-written file. Different supervisors touch different keys, so the
/// shared directory is safe across supervisors.
#[derive(Debug)]
pub struct FileTokenStore {
    dir: PathBuf,
    lock_file: PathBuf,
}

impl FileTokenStore {
    pub async fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
        }

        let lock_file = dir.join("lock");
        Ok(Self { dir, lock_file })
    }

    fn entry_path(&self, identity_key: &str) -> PathBuf {
        self.dir.join(format!("{identity_key}.json"))
    }

    fn sub_cache_path(&self, identity_key: &str, kind: &str) -> PathBuf {
        self.dir.join(format!("{identity_key}.{kind}.json"))
    }

    fn acquire_lock(&self) -> Result<std::fs::File> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_file)?;
        file.lock_exclusive()?;
        Ok(file)
    }

    async fn write_atomic(&self, path: &Path, contents: &str) -> Result<()> {
        let temp = path.with_extension("tmp");
        fs::write(&temp, contents).await?;

        let file = std::fs::File::open(&temp)?;
        file.sync_all()?;
        fs::rename(&temp, path).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

}

#[async_trait::async_trait]
impl TokenStore for FileTokenStore {
    async fn load(&self, identity_key: &str) -> Option<TokenCacheEntry> {
        let path = self.entry_path(identity_key);
        let content = fs::read_to_string(&path).await.ok()?;
        match serde_json::from_str(&content) {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!(key = identity_key, "discarding unparseable cache entry: {e}");
                None
            }
        }
    }

    async fn save(&self, identity_key: &str, entry: &TokenCacheEntry) -> Result<()> {
        let _lock = self.acquire_lock()?;
        let json = serde_json::to_string_pretty(entry)
            .map_err(|e| crate::errors::AuthError::MalformedResponse(e.to_string()))?;
        self.write_atomic(&self.entry_path(identity_key), &json).await
    }

    async fn invalidate(&self, identity_key: &str) -> Result<()> {
        let _lock = self.acquire_lock()?;

        let mut paths = vec![self.entry_path(identity_key)];
        for kind in SUB_CACHES {
            paths.push(self.sub_cache_path(identity_key, kind));
        }

        for path in paths {
            match fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "removed cache file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn save_sub(&self, identity_key: &str, kind: &str, value: &serde_json::Value) {
        let path = self.sub_cache_path(identity_key, kind);
        match serde_json::to_string_pretty(value) {
            Ok(json) => {
                if let Err(e) = self.write_atomic(&path, &json).await {
                    warn!(key = identity_key, kind, "failed to write sub-cache: {e}");
                }
            }
            Err(e) => warn!(key = identity_key, kind, "failed to serialize sub-cache: {e}"),
        }
    }

    async fn load_sub(&self, identity_key: &str, kind: &str) -> Option<serde_json::Value> {
        let path = self.sub_cache_path(identity_key, kind);
        let content = fs::read_to_string(&path).await.ok()?;
        serde_json::from_str(&content).ok()
    }
}
