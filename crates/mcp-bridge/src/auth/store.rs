//! Token and metadata caches.

use std::{
    collections::HashMap,
    io::Write,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use jsonwebtoken::jwk::JwkSet;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::types::{AuthorizationServerMetadata, ClientConfig, Token, TokenCacheKey};
use crate::error::{Error, Result};

/// Caches OAuth client registrations, discovery documents, issuer keys and
/// tokens. Implementations must be safe for concurrent use.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn client_config(&self, issuer: &str) -> Option<ClientConfig>;
    async fn add_client_config(&self, issuer: &str, config: ClientConfig) -> Result<()>;

    async fn authorization_server_metadata(
        &self,
        issuer: &str,
    ) -> Option<AuthorizationServerMetadata>;
    async fn add_authorization_server_metadata(
        &self,
        issuer: &str,
        metadata: AuthorizationServerMetadata,
    ) -> Result<()>;

    async fn issuer_public_keys(&self, issuer: &str) -> Option<JwkSet>;
    async fn add_issuer_public_keys(&self, issuer: &str, keys: JwkSet) -> Result<()>;

    /// The cached token for `key`, expired or not.
    async fn token(&self, key: &TokenCacheKey) -> Option<Token>;
    async fn add_token(&self, key: &TokenCacheKey, token: Token) -> Result<()>;
    async fn remove_token(&self, key: &TokenCacheKey) -> Result<()>;
    async fn tokens(&self) -> Vec<(TokenCacheKey, Token)>;
}

#[derive(Default)]
struct Entries {
    clients: HashMap<String, ClientConfig>,
    metadata: HashMap<String, AuthorizationServerMetadata>,
    keys: HashMap<String, JwkSet>,
    tokens: HashMap<TokenCacheKey, Token>,
}

/// A process-lifetime store.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<Entries>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clients(clients: impl IntoIterator<Item = (String, ClientConfig)>) -> Self {
        let entries = Entries {
            clients: clients.into_iter().collect(),
            ..Default::default()
        };
        Self {
            entries: RwLock::new(entries),
        }
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn client_config(&self, issuer: &str) -> Option<ClientConfig> {
        self.entries.read().await.clients.get(issuer).cloned()
    }

    async fn add_client_config(&self, issuer: &str, config: ClientConfig) -> Result<()> {
        self.entries
            .write()
            .await
            .clients
            .insert(issuer.to_string(), config);
        Ok(())
    }

    async fn authorization_server_metadata(
        &self,
        issuer: &str,
    ) -> Option<AuthorizationServerMetadata> {
        self.entries.read().await.metadata.get(issuer).cloned()
    }

    async fn add_authorization_server_metadata(
        &self,
        issuer: &str,
        metadata: AuthorizationServerMetadata,
    ) -> Result<()> {
        self.entries
            .write()
            .await
            .metadata
            .insert(issuer.to_string(), metadata);
        Ok(())
    }

    async fn issuer_public_keys(&self, issuer: &str) -> Option<JwkSet> {
        self.entries.read().await.keys.get(issuer).cloned()
    }

    async fn add_issuer_public_keys(&self, issuer: &str, keys: JwkSet) -> Result<()> {
        self.entries
            .write()
            .await
            .keys
            .insert(issuer.to_string(), keys);
        Ok(())
    }

    async fn token(&self, key: &TokenCacheKey) -> Option<Token> {
        self.entries.read().await.tokens.get(key).cloned()
    }

    async fn add_token(&self, key: &TokenCacheKey, token: Token) -> Result<()> {
        self.entries.write().await.tokens.insert(key.clone(), token);
        Ok(())
    }

    async fn remove_token(&self, key: &TokenCacheKey) -> Result<()> {
        self.entries.write().await.tokens.remove(key);
        Ok(())
    }

    async fn tokens(&self) -> Vec<(TokenCacheKey, Token)> {
        self.entries
            .read()
            .await
            .tokens
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TokenFile {
    #[serde(default)]
    tokens: HashMap<String, Token>,
}

/// A store that persists tokens to a JSON file. Client registrations and
/// discovery documents can be recovered and stay in memory.
pub struct FileStore {
    memory: MemoryStore,
    path: PathBuf,
}

impl FileStore {
    /// Open `path`, loading any tokens already stored there.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = Entries {
            tokens: load_tokens(&path)?,
            ..Default::default()
        };
        Ok(Self {
            memory: MemoryStore {
                entries: RwLock::new(entries),
            },
            path,
        })
    }

    pub fn with_clients(
        mut self,
        clients: impl IntoIterator<Item = (String, ClientConfig)>,
    ) -> Self {
        self.memory.entries.get_mut().clients.extend(clients);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `tokens` out on the blocking pool. Callers hold the entries
    /// lock across this, so writes land in order.
    async fn persist(&self, tokens: &HashMap<TokenCacheKey, Token>) -> Result<()> {
        let file = TokenFile {
            tokens: tokens
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        };
        let data = serde_json::to_vec_pretty(&file)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &data))
            .await
            .map_err(|e| Error::InternalError(format!("token store write failed: {e}")))?
    }
}

fn load_tokens(path: &Path) -> Result<HashMap<TokenCacheKey, Token>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e.into()),
    };
    let file: TokenFile = serde_json::from_slice(&data)?;
    let mut tokens = HashMap::new();
    for (key, token) in file.tokens {
        match key.parse::<TokenCacheKey>() {
            Ok(key) => {
                tokens.insert(key, token);
            }
            Err(e) => warn!("Skipping stored token: {}", e),
        }
    }
    debug!("Loaded {} tokens from {}", tokens.len(), path.display());
    Ok(tokens)
}

#[async_trait]
impl TokenStore for FileStore {
    async fn client_config(&self, issuer: &str) -> Option<ClientConfig> {
        self.memory.client_config(issuer).await
    }

    async fn add_client_config(&self, issuer: &str, config: ClientConfig) -> Result<()> {
        self.memory.add_client_config(issuer, config).await
    }

    async fn authorization_server_metadata(
        &self,
        issuer: &str,
    ) -> Option<AuthorizationServerMetadata> {
        self.memory.authorization_server_metadata(issuer).await
    }

    async fn add_authorization_server_metadata(
        &self,
        issuer: &str,
        metadata: AuthorizationServerMetadata,
    ) -> Result<()> {
        self.memory
            .add_authorization_server_metadata(issuer, metadata)
            .await
    }

    async fn issuer_public_keys(&self, issuer: &str) -> Option<JwkSet> {
        self.memory.issuer_public_keys(issuer).await
    }

    async fn add_issuer_public_keys(&self, issuer: &str, keys: JwkSet) -> Result<()> {
        self.memory.add_issuer_public_keys(issuer, keys).await
    }

    async fn token(&self, key: &TokenCacheKey) -> Option<Token> {
        self.memory.token(key).await
    }

    async fn add_token(&self, key: &TokenCacheKey, token: Token) -> Result<()> {
        let mut entries = self.memory.entries.write().await;
        entries.tokens.insert(key.clone(), token);
        self.persist(&entries.tokens).await
    }

    async fn remove_token(&self, key: &TokenCacheKey) -> Result<()> {
        let mut entries = self.memory.entries.write().await;
        if entries.tokens.remove(key).is_some() {
            self.persist(&entries.tokens).await?;
        }
        Ok(())
    }

    async fn tokens(&self) -> Vec<(TokenCacheKey, Token)> {
        self.memory.tokens().await
    }
}

/// Replace `path` with `data` via a temporary file in the same directory,
/// so readers only ever see a complete document. The file is private to the
/// user and its directory is created private when missing.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if !dir.exists() {
        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder.create(&dir)?;
    }

    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn key() -> TokenCacheKey {
        TokenCacheKey::new("https://issuer.example", &[])
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new();
        assert!(store.token(&key()).await.is_none());
        store.add_token(&key(), Token::bearer("a")).await.unwrap();
        assert_eq!(store.token(&key()).await.unwrap().access_token, "a");
        store.remove_token(&key()).await.unwrap();
        assert!(store.tokens().await.is_empty());

        store
            .add_client_config("https://issuer.example", ClientConfig::new("cid"))
            .await
            .unwrap();
        assert_eq!(
            store
                .client_config("https://issuer.example")
                .await
                .unwrap()
                .client_id,
            "cid"
        );
    }

    #[tokio::test]
    async fn test_file_store_persists_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tokens.json");
        {
            let store = FileStore::open(&path).unwrap();
            let token = Token::bearer("persisted")
                .with_expiry(Utc::now() + chrono::Duration::hours(1));
            store.add_token(&key(), token).await.unwrap();
            store
                .add_client_config("https://issuer.example", ClientConfig::new("cid"))
                .await
                .unwrap();
        }

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(
            raw["tokens"]["https://issuer.example|"]["accessToken"],
            "persisted"
        );
        assert!(raw.get("clients").is_none());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
            let dir_mode = std::fs::metadata(path.parent().unwrap())
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(dir_mode & 0o777, 0o700);
        }

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(
            reopened.token(&key()).await.unwrap().access_token,
            "persisted"
        );
        assert!(reopened.client_config("https://issuer.example").await.is_none());
    }

    #[tokio::test]
    async fn test_file_store_persists_removal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let store = FileStore::open(&path).unwrap();
        store.add_token(&key(), Token::bearer("gone")).await.unwrap();
        store.remove_token(&key()).await.unwrap();

        let reopened = FileStore::open(&path).unwrap();
        assert!(reopened.token(&key()).await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_writers_leave_valid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let store = std::sync::Arc::new(FileStore::open(&path).unwrap());
        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let key = TokenCacheKey::new(format!("https://issuer{i}.example"), &[]);
                store.add_token(&key, Token::bearer(format!("t{i}"))).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["tokens"].as_object().unwrap().len(), 16);
    }
}
