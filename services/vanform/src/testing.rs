//! In-memory collaborators for unit tests

use anyhow::{bail, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::client::{
    AppRoleCredentials, AppRoleSession, AuthBackend, AuthLease, KvStore, StoreConnection,
    StoreConnector,
};
use crate::error::StoreError;
use crate::van::{ConfigLoader, SiteResolver, Token, TokenHandler, VanConfig};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// KV v2 store kept in a map keyed by mount-relative path
pub struct MemoryKv {
    mount: String,
    entries: Mutex<BTreeMap<String, Map<String, Value>>>,
    puts: AtomicUsize,
    fail_puts: AtomicBool,
    failing_lists: Mutex<HashSet<String>>,
    failing_gets: Mutex<HashSet<String>>,
}

impl MemoryKv {
    pub fn new(mount: &str) -> Self {
        Self {
            mount: mount.to_string(),
            entries: Mutex::new(BTreeMap::new()),
            puts: AtomicUsize::new(0),
            fail_puts: AtomicBool::new(false),
            failing_lists: Mutex::new(HashSet::new()),
            failing_gets: Mutex::new(HashSet::new()),
        }
    }

    pub fn insert_raw(&self, path: &str, data: Map<String, Value>) {
        self.entries.lock().unwrap().insert(path.to_string(), data);
    }

    pub fn payload(&self, path: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap()
            .get(path)
            .and_then(|data| data.get("token"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn fail_puts(&self) {
        self.fail_puts.store(true, Ordering::SeqCst);
    }

    pub fn fail_list(&self, logical_path: &str) {
        self.failing_lists
            .lock()
            .unwrap()
            .insert(logical_path.to_string());
    }

    pub fn fail_get(&self, path: &str) {
        self.failing_gets.lock().unwrap().insert(path.to_string());
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn list(&self, logical_path: &str) -> Result<Option<Vec<String>>, StoreError> {
        if self.failing_lists.lock().unwrap().contains(logical_path) {
            return Err(StoreError::Status {
                status: 500,
                path: logical_path.to_string(),
                message: "internal error".to_string(),
            });
        }
        let prefix = format!("{}/metadata/", self.mount);
        let dir = logical_path
            .strip_prefix(&prefix)
            .map(|rel| format!("{}/", rel))
            .ok_or_else(|| StoreError::Malformed {
                path: logical_path.to_string(),
                message: "outside of mount".to_string(),
            })?;

        let keys: Vec<String> = self
            .entries
            .lock()
            .unwrap()
            .keys()
            .filter_map(|key| key.strip_prefix(&dir))
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect();
        Ok(if keys.is_empty() { None } else { Some(keys) })
    }

    async fn get(&self, path: &str) -> Result<Map<String, Value>, StoreError> {
        if self.failing_gets.lock().unwrap().contains(path) {
            return Err(StoreError::Status {
                status: 403,
                path: path.to_string(),
                message: "permission denied".to_string(),
            });
        }
        self.entries
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                path: path.to_string(),
            })
    }

    async fn put(&self, path: &str, data: Map<String, Value>) -> Result<(), StoreError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StoreError::Status {
                status: 503,
                path: path.to_string(),
                message: "sealed".to_string(),
            });
        }
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.insert_raw(path, data);
        Ok(())
    }
}

/// Auth backend answering from a script
pub struct ScriptedAuth {
    lease_duration: u64,
    renewable: bool,
    login_error: Mutex<Option<StoreError>>,
    renewals: Mutex<VecDeque<Result<AuthLease, StoreError>>>,
    logins: AtomicUsize,
    renews: AtomicUsize,
}

impl ScriptedAuth {
    pub fn login_ok(lease_duration: u64, renewable: bool) -> Self {
        Self {
            lease_duration,
            renewable,
            login_error: Mutex::new(None),
            renewals: Mutex::new(VecDeque::new()),
            logins: AtomicUsize::new(0),
            renews: AtomicUsize::new(0),
        }
    }

    pub fn login_err(err: StoreError) -> Self {
        let auth = Self::login_ok(3600, true);
        *auth.login_error.lock().unwrap() = Some(err);
        auth
    }

    pub fn renewals(script: Vec<Result<AuthLease, StoreError>>) -> Self {
        Self::login_ok(3600, true).with_renewals(script)
    }

    pub fn with_renewals(self, script: Vec<Result<AuthLease, StoreError>>) -> Self {
        *self.renewals.lock().unwrap() = script.into();
        self
    }

    pub fn login_calls(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn renew_calls(&self) -> usize {
        self.renews.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthBackend for ScriptedAuth {
    async fn login(
        &self,
        _auth_method_path: &str,
        _role_id: &str,
        _secret_id: &str,
    ) -> Result<AuthLease, StoreError> {
        let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(err) = self.login_error.lock().unwrap().take() {
            return Err(err);
        }
        Ok(AuthLease {
            client_token: format!("s.token-{}", n),
            lease_duration: self.lease_duration,
            renewable: self.renewable,
        })
    }

    async fn renew_self(
        &self,
        client_token: &str,
        _increment: u64,
    ) -> Result<AuthLease, StoreError> {
        self.renews.fetch_add(1, Ordering::SeqCst);
        self.renewals
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(AuthLease {
                    client_token: client_token.to_string(),
                    lease_duration: self.lease_duration,
                    renewable: true,
                })
            })
    }
}

/// Local operation recorded by [`MemoryHandler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOp {
    Save(String),
    Delete(String),
}

/// Token handler holding local resources in memory
#[derive(Default)]
pub struct MemoryHandler {
    local: Mutex<Vec<Token>>,
    generated: Mutex<Vec<Token>>,
    ops: Mutex<Vec<HandlerOp>>,
    failing_deletes: Mutex<HashSet<String>>,
    fail_load: AtomicBool,
}

impl MemoryHandler {
    pub fn with_local(tokens: Vec<Token>) -> Self {
        let handler = Self::default();
        for mut token in tokens {
            token.prepare();
            handler.local.lock().unwrap().push(token);
        }
        handler
    }

    pub fn set_generated(&self, tokens: Vec<Token>) {
        *self.generated.lock().unwrap() = tokens;
    }

    pub fn ops(&self) -> Vec<HandlerOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn local_names(&self) -> Vec<String> {
        self.local
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.link_name().to_string())
            .collect()
    }

    pub fn fail_delete(&self, link_name: &str) {
        self.failing_deletes
            .lock()
            .unwrap()
            .insert(link_name.to_string());
    }

    pub fn fail_load(&self) {
        self.fail_load.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl TokenHandler for MemoryHandler {
    async fn load(&self) -> Result<Vec<Token>> {
        if self.fail_load.load(Ordering::SeqCst) {
            bail!("failed to list links");
        }
        Ok(self
            .local
            .lock()
            .unwrap()
            .iter()
            .filter(|t| Token::is_managed(&t.link.metadata))
            .cloned()
            .collect())
    }

    async fn save(&self, mut token: Token) -> Result<()> {
        token.prepare();
        let name = token.link_name().to_string();
        let mut local = self.local.lock().unwrap();
        local.retain(|t| t.link_name() != name);
        local.push(token);
        self.ops.lock().unwrap().push(HandlerOp::Save(name));
        Ok(())
    }

    async fn generate(&self, config: &VanConfig) -> Result<Vec<Token>> {
        if !config.zones.reachable() {
            return Ok(Vec::new());
        }
        Ok(self.generated.lock().unwrap().clone())
    }

    async fn delete(&self, token: &Token) -> Result<()> {
        let name = token.link_name().to_string();
        if self.failing_deletes.lock().unwrap().contains(&name) {
            bail!("failed to delete link {}", name);
        }
        self.local.lock().unwrap().retain(|t| t.link_name() != name);
        self.ops.lock().unwrap().push(HandlerOp::Delete(name));
        Ok(())
    }
}

/// Config loader returning a mutable in-memory configuration
pub struct StaticConfig {
    config: Mutex<VanConfig>,
    secret: Secret,
}

impl StaticConfig {
    pub fn new(config: VanConfig) -> Self {
        let mut secret = Secret::default();
        secret.metadata.name = Some(config.secret.clone());
        secret.data = Some(BTreeMap::from([
            ("role-id".to_string(), ByteString(b"role".to_vec())),
            ("secret-id".to_string(), ByteString(b"secret".to_vec())),
        ]));
        Self {
            config: Mutex::new(config),
            secret,
        }
    }

    pub fn set(&self, config: VanConfig) {
        *self.config.lock().unwrap() = config;
    }
}

#[async_trait]
impl ConfigLoader for StaticConfig {
    async fn load_config(&self) -> Result<(VanConfig, Secret)> {
        Ok((self.config.lock().unwrap().clone(), self.secret.clone()))
    }
}

/// Connector handing out sessions over [`ScriptedAuth`] and a shared store
pub struct MemoryConnector {
    pub store: Arc<MemoryKv>,
    pub auth: Arc<ScriptedAuth>,
    connects: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(store: Arc<MemoryKv>, auth: Arc<ScriptedAuth>) -> Self {
        Self {
            store,
            auth,
            connects: AtomicUsize::new(0),
        }
    }

    pub fn connect_calls(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl StoreConnector for MemoryConnector {
    fn connect(
        &self,
        _config: &VanConfig,
        credentials: AppRoleCredentials,
    ) -> crate::error::Result<StoreConnection> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let session = AppRoleSession::new(self.auth.clone()).with_credentials(credentials);
        Ok(StoreConnection {
            session: Arc::new(session),
            store: self.store.clone(),
        })
    }
}

/// Site resolver with a fixed answer
pub struct FixedSite(pub Option<String>);

#[async_trait]
impl SiteResolver for FixedSite {
    async fn site_name(&self) -> Result<String> {
        match &self.0 {
            Some(name) => Ok(name.clone()),
            None => bail!("no ready site found"),
        }
    }
}
