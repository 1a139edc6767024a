use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use directories::BaseDirs;
use job_queue::JobQueue;
use notifo_connection::join_api;
use notifo_model::{RegisterRequest, RegisterResponse};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use url::Url;

const REGISTER_PATH: &str = "api/web/register";
const CACHE_FILE: &str = "registrations.json";

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("failed to decode registration response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid registration endpoint: {0}")]
    InvalidUrl(String),
    #[error("registration was dropped before it completed")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed cache file: {0}")]
    Json(#[from] serde_json::Error),
}

/// Registrations already performed, stored as one JSON object mapping the
/// cache key to the server's response.
#[derive(Debug, Clone)]
pub struct RegistrationCache {
    path: PathBuf,
}

impl RegistrationCache {
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(CACHE_FILE),
        }
    }

    /// `<cache_dir>/notifo/registrations.json`.
    pub fn default_location() -> Option<Self> {
        BaseDirs::new().map(|base| Self::in_dir(base.cache_dir().join("notifo")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hex SHA-256 over everything that determines the registered user, so
    /// a different server, key or profile never reuses a cached token.
    pub fn key(api_url: &Url, api_key: &str, request: &RegisterRequest) -> Result<String, CacheError> {
        let body = serde_json::to_string(request)?;
        let digest = Sha256::new()
            .chain_update(api_url.as_str().as_bytes())
            .chain_update(api_key.as_bytes())
            .chain_update(body.as_bytes())
            .finalize();
        Ok(hex::encode(digest))
    }

    fn read_all(&self) -> Result<HashMap<String, RegisterResponse>, CacheError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let raw = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn load(&self, key: &str) -> Result<Option<RegisterResponse>, CacheError> {
        Ok(self.read_all()?.remove(key))
    }

    pub fn store(&self, key: &str, response: &RegisterResponse) -> Result<(), CacheError> {
        // A corrupt file is replaced rather than blocking new entries.
        let mut entries = self.read_all().unwrap_or_default();
        entries.insert(key.to_string(), response.clone());

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let serialized = serde_json::to_string_pretty(&entries)?;
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path)?;
        file.write_all(serialized.as_bytes())?;
        Ok(())
    }
}

struct RegistrarInner {
    http: reqwest::Client,
    api_url: Url,
    endpoint: Url,
    api_key: String,
    cache: Option<RegistrationCache>,
}

impl RegistrarInner {
    fn cache_key(&self, request: &RegisterRequest) -> Option<String> {
        self.cache.as_ref()?;
        match RegistrationCache::key(&self.api_url, &self.api_key, request) {
            Ok(key) => Some(key),
            Err(err) => {
                warn!(target: "notifo.registration", error = %err, "cannot derive cache key");
                None
            }
        }
    }

    fn cached(&self, key: &str) -> Option<RegisterResponse> {
        let cache = self.cache.as_ref()?;
        match cache.load(key) {
            Ok(hit) => hit,
            Err(err) => {
                warn!(
                    target: "notifo.registration",
                    path = ?cache.path(),
                    error = %err,
                    "ignoring unreadable registration cache"
                );
                None
            }
        }
    }

    fn remember(&self, key: &str, response: &RegisterResponse) {
        if let Some(cache) = &self.cache {
            if let Err(err) = cache.store(key, response) {
                warn!(
                    target: "notifo.registration",
                    path = ?cache.path(),
                    error = %err,
                    "failed to write registration cache"
                );
            }
        }
    }

    async fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse, RegistrationError> {
        let key = self.cache_key(request);
        if let Some(hit) = key.as_deref().and_then(|key| self.cached(key)) {
            debug!(target: "notifo.registration", user_id = %hit.user_id, "using cached registration");
            return Ok(hit);
        }

        let res = self
            .http
            .post(self.endpoint.clone())
            .header("X-ApiKey", &self.api_key)
            .json(request)
            .send()
            .await?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(RegistrationError::UnexpectedStatus { status, body });
        }

        let response: RegisterResponse = serde_json::from_slice(&res.bytes().await?)?;
        info!(target: "notifo.registration", user_id = %response.user_id, "registered user");
        if let Some(key) = key.as_deref() {
            self.remember(key, &response);
        }
        Ok(response)
    }
}

/// Registers widget users with an app-level API key.
///
/// Requests run one at a time through the shared [`JobQueue`], and results
/// are cached so a restart with the same profile skips the round trip.
#[derive(Clone)]
pub struct Registrar {
    inner: Arc<RegistrarInner>,
    queue: JobQueue,
}

impl Registrar {
    pub fn new(
        api_url: &Url,
        api_key: impl Into<String>,
        cache: Option<RegistrationCache>,
        queue: JobQueue,
    ) -> Result<Self, RegistrationError> {
        let endpoint = join_api(api_url, REGISTER_PATH)
            .map_err(|err| RegistrationError::InvalidUrl(err.to_string()))?;
        Ok(Self {
            inner: Arc::new(RegistrarInner {
                http: reqwest::Client::new(),
                api_url: api_url.clone(),
                endpoint,
                api_key: api_key.into(),
                cache,
            }),
            queue,
        })
    }

    pub async fn register(&self, request: RegisterRequest) -> Result<RegisterResponse, RegistrationError> {
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        self.queue.enqueue(move || async move {
            let outcome = inner.register(&request).await;
            let failure = outcome.as_ref().err().map(ToString::to_string);
            let _ = tx.send(outcome);
            match failure {
                Some(message) => Err(anyhow::anyhow!("registration failed: {message}")),
                None => Ok(()),
            }
        });
        rx.await.map_err(|_| RegistrationError::Cancelled)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notifo_model::CreateUser;

    fn request(name: &str) -> RegisterRequest {
        RegisterRequest {
            create_user: CreateUser {
                display_name: Some(name.to_string()),
                ..CreateUser::default()
            },
            topics_to_subscribe: vec![],
        }
    }

    fn response(user: &str) -> RegisterResponse {
        RegisterResponse {
            user_id: user.to_string(),
            user_token: format!("{user}-token"),
        }
    }

    #[test]
    fn key_depends_on_every_input() {
        let url = Url::parse("https://app.notifo.io").unwrap();
        let other_url = Url::parse("https://self.hosted").unwrap();
        let base = RegistrationCache::key(&url, "key", &request("Ada")).unwrap();

        assert_eq!(base.len(), 64);
        assert_eq!(base, RegistrationCache::key(&url, "key", &request("Ada")).unwrap());
        assert_ne!(base, RegistrationCache::key(&other_url, "key", &request("Ada")).unwrap());
        assert_ne!(base, RegistrationCache::key(&url, "key2", &request("Ada")).unwrap());
        assert_ne!(base, RegistrationCache::key(&url, "key", &request("Grace")).unwrap());
    }

    #[test]
    fn stores_and_loads_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RegistrationCache::in_dir(dir.path().join("nested"));

        assert_eq!(cache.load("a").unwrap(), None);
        cache.store("a", &response("u1")).unwrap();
        cache.store("b", &response("u2")).unwrap();

        assert_eq!(cache.load("a").unwrap(), Some(response("u1")));
        assert_eq!(cache.load("b").unwrap(), Some(response("u2")));
        assert!(cache.path().ends_with("nested/registrations.json"));
    }

    #[test]
    fn corrupt_file_is_reported_then_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RegistrationCache::in_dir(dir.path());
        fs::write(cache.path(), "{ not json").unwrap();

        assert!(matches!(cache.load("a"), Err(CacheError::Json(_))));
        cache.store("a", &response("u1")).unwrap();
        assert_eq!(cache.load("a").unwrap(), Some(response("u1")));
    }

    #[test]
    fn endpoint_keeps_base_path() {
        let base = Url::parse("https://notify.example.com/notifo/").unwrap();
        let registrar = Registrar::new(&base, "key", None, JobQueue::new()).unwrap();
        assert_eq!(
            registrar.inner.endpoint.as_str(),
            "https://notify.example.com/notifo/api/web/register"
        );
    }
}
