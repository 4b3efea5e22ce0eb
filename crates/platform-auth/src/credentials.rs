//! Credential storage for the admin session
//!
//! A session holds exactly one credential pair. `TokenStore` is the seam the
//! refresh coordinator writes through; `MemoryTokenStore` keeps it in-process
//! and `FileTokenStore` persists it as JSON so a gateway restart keeps the
//! session. File writes use atomic temp-file + rename to prevent corruption
//! on crash.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::secret::Secret;

/// Access/refresh token pair for the signed-in admin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    /// Short-lived bearer token for API calls
    pub access_token: Secret,
    /// Longer-lived token exchanged for a new access token
    pub refresh_token: Secret,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: Secret::new(access_token),
            refresh_token: Secret::new(refresh_token),
        }
    }
}

/// Holder of the current credential.
///
/// Implementations only need atomic read/replace: every refresh-driven write
/// happens inside the coordinator's single-flight section.
pub trait TokenStore: Send + Sync {
    /// Current credential, if signed in.
    fn get(&self) -> Pin<Box<dyn Future<Output = Option<Credential>> + Send + '_>>;

    /// Replace the credential (login or successful refresh).
    fn set(&self, credential: Credential) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Forget the credential (logout or unrecoverable refresh failure).
    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// In-process store. The credential is lost on restart.
#[derive(Default)]
pub struct MemoryTokenStore {
    state: Mutex<Option<Credential>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with a credential.
    pub fn with_credential(credential: Credential) -> Self {
        Self {
            state: Mutex::new(Some(credential)),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self) -> Pin<Box<dyn Future<Output = Option<Credential>> + Send + '_>> {
        Box::pin(async move { self.state.lock().await.clone() })
    }

    fn set(&self, credential: Credential) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            *self.state.lock().await = Some(credential);
            Ok(())
        })
    }

    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.state.lock().await.take();
            Ok(())
        })
    }
}

/// On-disk representation. Field names match the platform API payloads.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredCredential {
    access_token: String,
    refresh_token: String,
}

/// JSON-file backed store.
///
/// The Mutex serializes writes; reads clone the in-memory copy so request-time
/// lookups never touch the disk.
pub struct FileTokenStore {
    path: PathBuf,
    state: Mutex<Option<Credential>>,
}

impl FileTokenStore {
    /// Load the credential from `path`.
    ///
    /// A missing file is a cold start with no session; nothing is created
    /// until the first `set`.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
            let stored: StoredCredential = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;
            info!(path = %path.display(), "loaded stored session credential");
            Some(Credential::new(stored.access_token, stored.refresh_token))
        } else {
            info!(path = %path.display(), "no stored credential, starting signed out");
            None
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TokenStore for FileTokenStore {
    fn get(&self) -> Pin<Box<dyn Future<Output = Option<Credential>> + Send + '_>> {
        Box::pin(async move { self.state.lock().await.clone() })
    }

    fn set(&self, credential: Credential) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            // Memory is updated even if the write fails
            let mut state = self.state.lock().await;
            *state = Some(credential.clone());
            write_atomic(&self.path, &credential).await?;
            debug!(path = %self.path.display(), "stored credential");
            Ok(())
        })
    }

    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.take();
            match tokio::fs::remove_file(&self.path).await {
                Ok(()) => {
                    debug!(path = %self.path.display(), "removed credential file");
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(Error::Io(format!("removing credential file: {e}"))),
            }
        })
    }
}

/// Write the credential to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over the
/// target. Sets file permissions to 0600 (owner read/write only) since the
/// file contains bearer tokens.
async fn write_atomic(path: &Path, credential: &Credential) -> Result<()> {
    let stored = StoredCredential {
        access_token: credential.access_token.expose().to_string(),
        refresh_token: credential.refresh_token.expose().to_string(),
    };
    let json = serde_json::to_string_pretty(&stored)
        .map_err(|e| Error::CredentialParse(format!("serializing credential: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".session.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    Ok(())
}
