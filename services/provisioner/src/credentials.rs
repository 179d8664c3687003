//! Named identities used to log onto remote hosts.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::context::{ComputeProvider, CredentialStore};
use crate::error::ConfigurationError;

// =============================================================================
// Secret material
// =============================================================================

/// Secret string that never prints itself.
///
/// `Debug` and `Display` show a short SHA-256 fingerprint instead.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// `sha256:` followed by the first 8 bytes of the digest, hex encoded.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        format!("sha256:{}", hex::encode(&digest[..8]))
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({})", self.fingerprint())
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<redacted {}>", self.fingerprint())
    }
}

// =============================================================================
// Credentials
// =============================================================================

/// An identity for logging onto a host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Credentials {
    Password {
        user: String,
        password: Secret,
    },
    /// Key pair read from disk when the registry was loaded.
    KeyPair {
        user: String,
        private_key_path: PathBuf,
        public_key_path: Option<PathBuf>,
        private_key: Secret,
        public_key: Option<String>,
    },
    /// Key pair minted and kept by the compute provider.
    GeneratedKeyPair {
        user: String,
        private_key: Secret,
    },
}

impl Credentials {
    pub fn password(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Password {
            user: user.into(),
            password: Secret::new(password),
        }
    }

    /// Read a key pair from disk.
    ///
    /// Files are read immediately; an unreadable file is an error rather than
    /// a credential that fails later.
    pub async fn key_pair(
        name: &str,
        user: impl Into<String>,
        private_key_path: &Path,
        public_key_path: Option<&Path>,
    ) -> Result<Self, ConfigurationError> {
        let private_key = read_key(name, "private key", private_key_path).await?;
        let public_key = match public_key_path {
            Some(path) => Some(read_key(name, "public key", path).await?),
            None => None,
        };

        Ok(Self::KeyPair {
            user: user.into(),
            private_key_path: private_key_path.to_path_buf(),
            public_key_path: public_key_path.map(Path::to_path_buf),
            private_key: Secret::new(private_key),
            public_key,
        })
    }

    pub fn generated(user: impl Into<String>, private_key: impl Into<String>) -> Self {
        Self::GeneratedKeyPair {
            user: user.into(),
            private_key: Secret::new(private_key),
        }
    }

    pub fn user(&self) -> &str {
        match self {
            Self::Password { user, .. }
            | Self::KeyPair { user, .. }
            | Self::GeneratedKeyPair { user, .. } => user,
        }
    }

    /// Password or private key, whichever authenticates this identity.
    pub fn private_material(&self) -> &Secret {
        match self {
            Self::Password { password, .. } => password,
            Self::KeyPair { private_key, .. } | Self::GeneratedKeyPair { private_key, .. } => {
                private_key
            }
        }
    }

    pub fn is_password(&self) -> bool {
        matches!(self, Self::Password { .. })
    }

    pub fn variant(&self) -> &'static str {
        match self {
            Self::Password { .. } => "password",
            Self::KeyPair { .. } => "key-pair",
            Self::GeneratedKeyPair { .. } => "generated-key-pair",
        }
    }
}

impl fmt::Display for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(user={}, secret={})",
            self.variant(),
            self.user(),
            self.private_material().fingerprint()
        )
    }
}

async fn read_key(name: &str, field: &'static str, path: &Path) -> Result<String, ConfigurationError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigurationError::KeyUnreadable {
            name: name.to_string(),
            field,
            path: path.to_path_buf(),
            source,
        })
}

/// A credential as declared in the cluster file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum CredentialSource {
    Password {
        user: String,
        password: String,
    },
    KeyPair {
        user: String,
        private_key: PathBuf,
        #[serde(default)]
        public_key: Option<PathBuf>,
    },
}

// =============================================================================
// Registry
// =============================================================================

/// Name to credentials map with unique names.
#[derive(Debug, Default)]
pub struct CredentialRegistry {
    entries: RwLock<BTreeMap<String, Credentials>>,
}

impl CredentialRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from declared credentials.
    ///
    /// Every key file is read here. One unreadable file fails the whole load.
    pub async fn load(
        declared: &BTreeMap<String, CredentialSource>,
    ) -> Result<Self, ConfigurationError> {
        let mut entries = BTreeMap::new();
        for (name, source) in declared {
            let credentials = match source {
                CredentialSource::Password { user, password } => {
                    Credentials::password(user.clone(), password.clone())
                }
                CredentialSource::KeyPair {
                    user,
                    private_key,
                    public_key,
                } => {
                    Credentials::key_pair(name, user.clone(), private_key, public_key.as_deref())
                        .await?
                }
            };
            debug!(credential = %name, credentials = %credentials, "Loaded credential");
            entries.insert(name.clone(), credentials);
        }

        info!(count = entries.len(), "Credential registry loaded");
        Ok(Self {
            entries: RwLock::new(entries),
        })
    }

    /// Add key pairs generated by the provider. Names already declared keep
    /// their declared credentials. Returns how many were added.
    pub async fn merge_generated(
        &self,
        store: &dyn CredentialStore,
    ) -> Result<usize, ConfigurationError> {
        let keys = store
            .generated_key_pairs()
            .await
            .map_err(|source| ConfigurationError::Provider {
                operation: "list generated key pairs",
                source,
            })?;

        let mut entries = self.entries.write().await;
        let mut added = 0;
        for key in keys {
            if entries.contains_key(&key.name) {
                debug!(credential = %key.name, "Declared credential shadows generated key pair");
                continue;
            }
            entries.insert(key.name, Credentials::generated(key.user, key.private_key));
            added += 1;
        }
        info!(added, "Merged generated key pairs");
        Ok(added)
    }

    pub async fn register(
        &self,
        name: impl Into<String>,
        credentials: Credentials,
    ) -> Result<(), ConfigurationError> {
        let name = name.into();
        let mut entries = self.entries.write().await;
        if entries.contains_key(&name) {
            return Err(ConfigurationError::DuplicateCredential(name));
        }
        debug!(credential = %name, credentials = %credentials, "Registered credential");
        entries.insert(name, credentials);
        Ok(())
    }

    pub async fn resolve(&self, name: &str) -> Result<Credentials, ConfigurationError> {
        self.entries
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigurationError::CredentialNotFound(name.to_string()))
    }

    /// Mint a key pair through the compute provider and register it.
    ///
    /// The write lock is held across the provider call so that two callers
    /// racing on one name cannot both create a key pair.
    pub async fn generate(
        &self,
        name: &str,
        user: Option<&str>,
        compute: &dyn ComputeProvider,
    ) -> Result<Credentials, ConfigurationError> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(name) {
            return Err(ConfigurationError::DuplicateCredential(name.to_string()));
        }

        let key = compute
            .create_key_pair(name)
            .await
            .map_err(|source| ConfigurationError::Provider {
                operation: "create key pair",
                source,
            })?;
        let credentials = Credentials::generated(user.unwrap_or(&key.user), key.private_key);
        entries.insert(name.to_string(), credentials.clone());
        info!(credential = %name, "Generated key pair");
        Ok(credentials)
    }

    /// Registered names, sorted.
    pub async fn names(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
