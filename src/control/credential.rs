use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::debug;

use super::ControlError;

/// File holding an instance's binary authentication secret.
pub const CREDENTIAL_FILE_NAME: &str = "control_auth_cookie";

/// Upper bound on the secret size; anything larger is not a cookie.
const MAX_CREDENTIAL_BYTES: u64 = 4096;

/// Hex-encoded authentication secret for one instance.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Encode raw secret bytes as lowercase hex.
    pub fn from_bytes(raw: &[u8]) -> Self {
        Self(hex::encode(raw))
    }

    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential(<{} hex chars>)", self.0.len())
    }
}

struct CachedCredential {
    credential: Credential,
    fetched_at: SystemTime,
}

/// Per-instance credential cache with a short TTL.
///
/// Secrets are read from the instance's data directory, never from the
/// running process. Keyed by the credential file path so a configuration
/// reload that moves an instance's data directory is picked up at once.
pub struct CredentialCache {
    ttl: Duration,
    entries: HashMap<PathBuf, CachedCredential>,
}

impl CredentialCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Return the credential for the instance rooted at `data_dir`.
    pub fn fetch(&mut self, data_dir: &Path) -> Result<Credential, ControlError> {
        self.fetch_at(data_dir, SystemTime::now())
    }

    /// Same as [`fetch`](Self::fetch) with an explicit clock reading.
    pub fn fetch_at(
        &mut self,
        data_dir: &Path,
        now: SystemTime,
    ) -> Result<Credential, ControlError> {
        let path = data_dir.join(CREDENTIAL_FILE_NAME);

        if let Some(cached) = self.entries.get(&path) {
            // A fetch time in the future means the clock stepped back;
            // duration_since fails and the entry is not trusted.
            match now.duration_since(cached.fetched_at) {
                Ok(age) if age <= self.ttl => return Ok(cached.credential.clone()),
                Ok(_) => debug!(path = %path.display(), "cached credential expired"),
                Err(_) => debug!(path = %path.display(), "cached credential from the future"),
            }
        }

        let credential = read_credential(&path)?;
        self.entries.insert(
            path,
            CachedCredential {
                credential: credential.clone(),
                fetched_at: now,
            },
        );
        Ok(credential)
    }

    /// Drop the cached credential so the next fetch re-reads the file.
    pub fn invalidate(&mut self, data_dir: &Path) {
        self.entries.remove(&data_dir.join(CREDENTIAL_FILE_NAME));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn read_credential(path: &Path) -> Result<Credential, ControlError> {
    let unavailable = |source: std::io::Error| ControlError::CredentialUnavailable {
        path: path.to_path_buf(),
        source,
    };

    let meta = std::fs::metadata(path).map_err(unavailable)?;
    if meta.len() > MAX_CREDENTIAL_BYTES {
        return Err(unavailable(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("{} bytes exceeds {MAX_CREDENTIAL_BYTES}", meta.len()),
        )));
    }

    let raw = std::fs::read(path).map_err(unavailable)?;
    if raw.is_empty() {
        return Err(ControlError::EmptyCredential {
            path: path.to_path_buf(),
        });
    }

    Ok(Credential::from_bytes(&raw))
}
