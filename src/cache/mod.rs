//! Manifest cache of the asset bundle server.
//!
//! [`AssetBundleCache::update`] walks the API handshake (signature, game
//! version, registration, authentication, system data) and stores the
//! decrypted bundle index. The result persists as named message-pack.

pub mod client;
mod config;

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use indexmap::{IndexMap, IndexSet};
use rustc_hash::FxHashSet;
use serde_derive::{Deserialize, Serialize};

pub use config::{
    CacheConfig, DEFAULT_UNITY_VERSION, Endpoints, HOST_HASH_PLACEHOLDER, KeysetConfig, Platform,
    Region, expand_host,
};

use crate::crypto::DecryptingReader;
use crate::error::{Error, Result};
use crate::resolver::BundleResolver;

use client::{ApiClient, ApiRequest, HttpTransport, Method, Transport, field, field_string};

/// Block size of the decrypting stream behind [`AssetBundleCache::open_bundle`].
pub const BUNDLE_STREAM_BLOCK: usize = 65536;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Entry {
    pub bundle_name: String,
    pub cache_file_name: String,
    pub cache_directory_name: String,
    pub hash: String,
    pub category: String,
    pub crc: u64,
    pub file_size: u64,
    pub dependencies: Vec<String>,
    pub paths: Vec<String>,
    pub is_builtin: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetBundleIndex {
    pub version: String,
    pub os: String,
    pub bundles: IndexMap<String, Entry>,
}

impl AssetBundleIndex {
    pub fn get(&self, name: &str) -> Result<&Entry> {
        self.bundles
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("bundle '{name}' is not in the index")))
    }

    /// The dependency closure of `name` in post-order: every bundle comes
    /// after all of its dependencies, `name` itself last.
    ///
    /// Bundles already in `visited` are not descended into again, so passing
    /// a previous result back returns it unchanged.
    pub fn flatten_dependencies(
        &self,
        name: &str,
        visited: Option<IndexSet<String>>,
    ) -> Result<IndexSet<String>> {
        let mut order = visited.unwrap_or_default();
        let mut in_progress = FxHashSet::default();
        self.visit(name, &mut order, &mut in_progress)?;
        Ok(order)
    }

    fn visit(
        &self,
        name: &str,
        order: &mut IndexSet<String>,
        in_progress: &mut FxHashSet<String>,
    ) -> Result<()> {
        if order.contains(name) || !in_progress.insert(name.to_owned()) {
            return Ok(());
        }
        let entry = self.get(name)?;
        for dependency in &entry.dependencies {
            self.visit(dependency, order, in_progress)?;
        }
        order.insert(name.to_owned());
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Database {
    pub user_data: Option<rmpv::Value>,
    pub auth_data: Option<rmpv::Value>,
    pub system_data: Option<rmpv::Value>,
    pub game_version_data: Option<rmpv::Value>,
    /// Signature cookie of the last session, sent along with bundle downloads.
    pub cookie: Option<String>,
    pub index: Option<AssetBundleIndex>,
}

#[derive(Serialize, Deserialize)]
struct Persisted {
    config: CacheConfig,
    database: Database,
}

pub struct AssetBundleCache {
    pub config: CacheConfig,
    pub database: Database,
    transport: Arc<dyn Transport>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for AssetBundleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetBundleCache")
            .field("config", &self.config)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl AssetBundleCache {
    pub fn new(config: CacheConfig) -> Result<Self> {
        Ok(AssetBundleCache::with_transport(
            config,
            Arc::new(HttpTransport::new()?),
        ))
    }

    pub fn with_transport(config: CacheConfig, transport: Arc<dyn Transport>) -> Self {
        AssetBundleCache {
            config,
            database: Database::default(),
            transport,
            path: None,
        }
    }

    /// Loads a saved cache. Later updates persist back to `path`.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        AssetBundleCache::load_with_transport(path, Arc::new(HttpTransport::new()?))
    }

    pub fn load_with_transport(
        path: impl AsRef<Path>,
        transport: Arc<dyn Transport>,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("could not open cache {}", path.display()))?;
        let Persisted { config, database } = rmp_serde::from_read(BufReader::new(file))
            .with_context(|| format!("malformed cache {}", path.display()))?;
        Ok(AssetBundleCache {
            config,
            database,
            transport,
            path: Some(path.to_owned()),
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let persisted = Persisted {
            config: self.config.clone(),
            database: self.database.clone(),
        };
        let data = rmp_serde::to_vec_named(&persisted).context("could not encode cache")?;
        let mut writer = BufWriter::new(
            File::create(path)
                .with_context(|| format!("could not create cache {}", path.display()))?,
        );
        writer.write_all(&data)?;
        writer.flush()?;
        Ok(())
    }

    /// Where [`AssetBundleCache::update`] persists to.
    pub fn set_path(&mut self, path: impl Into<PathBuf>) {
        self.path = Some(path.into());
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Refreshes the database from the game API.
    ///
    /// Nothing is committed unless every step succeeds.
    pub fn update(&mut self) -> anyhow::Result<()> {
        let region = self.config.region;
        let mut client = ApiClient::new(&*self.transport, &self.config)?;

        tracing::info!("issuing signature for {region}");
        client.issue_signature().context("signature request failed")?;
        let cookie = client.cookie().map(str::to_owned);

        tracing::info!("fetching game version {}", self.config.app_version);
        let game_version = client.game_version().context("game version request failed")?;

        let mut user_data = self.database.user_data.clone();
        let (user_id, credential) =
            match (&self.config.auth_user_id, &self.config.auth_credential) {
                (Some(user_id), Some(credential)) => (user_id.clone(), credential.clone()),
                _ => {
                    if !matches!(region, Region::Jp | Region::En) {
                        return Err(Error::AuthFailed(format!(
                            "no credential configured and {region} does not support registration"
                        ))
                        .into());
                    }
                    tracing::info!("registering anonymous user");
                    let user = client.register().context("registration failed")?;
                    let user_id = field(&user, "userRegistration")
                        .and_then(|registration| field_string(registration, "userId"))
                        .or_else(|| field_string(&user, "userId"))
                        .ok_or_else(|| Error::AuthFailed("registration returned no user id".into()))?;
                    let credential = field_string(&user, "credential").ok_or_else(|| {
                        Error::AuthFailed("registration returned no credential".into())
                    })?;
                    user_data = Some(user);
                    (user_id, credential)
                }
            };

        tracing::info!("authenticating user {user_id}");
        let auth = client
            .authenticate(&user_id, &credential)
            .context("authentication failed")?;

        let mut config = self.config.clone();
        config.auth_user_id = Some(user_id);
        config.auth_credential = Some(credential);
        if let Some(hash) = field_string(&auth, "assetHash") {
            config.asset_hash = Some(hash);
        }
        if let Some(version) = field_string(&auth, "assetVersion") {
            config.asset_version = Some(version);
        }
        if let Some(host_hash) = field_string(&auth, "assetbundleHostHash")
            .or_else(|| field_string(&game_version, "assetbundleHostHash"))
        {
            config.host_hash = Some(host_hash);
        }

        tracing::info!("fetching system data");
        let system = client.system().context("system request failed")?;

        let version = config.bundle_version()?.to_owned();
        tracing::info!("fetching bundle index {version}");
        let body = client
            .asset_index(config.host_hash.as_deref(), &version)
            .context("bundle index request failed")?;
        let index: AssetBundleIndex = client
            .cipher()
            .unpack(&body)
            .context("could not decode bundle index")?;
        tracing::info!("index {} lists {} bundles", index.version, index.bundles.len());
        drop(client);

        self.config = config;
        self.database = Database {
            user_data,
            auth_data: Some(auth),
            system_data: Some(system),
            game_version_data: Some(game_version),
            cookie,
            index: Some(index),
        };
        if let Some(path) = &self.path {
            self.save(path)?;
            tracing::info!("saved cache to {}", path.display());
        }
        Ok(())
    }

    pub fn index(&self) -> Result<&AssetBundleIndex> {
        self.database
            .index
            .as_ref()
            .ok_or_else(|| Error::NotFound("bundle index, the cache was never updated".into()))
    }

    pub fn get_entry(&self, name: &str) -> Result<&Entry> {
        self.index()?.get(name)
    }

    pub fn flatten_dependencies(
        &self,
        name: &str,
        visited: Option<IndexSet<String>>,
    ) -> Result<IndexSet<String>> {
        self.index()?.flatten_dependencies(name, visited)
    }

    pub fn download_url(&self, entry: &Entry) -> Result<String> {
        let endpoints = self.config.endpoints()?;
        let host = expand_host(&endpoints.assetbundle, self.config.host_hash.as_deref())?;
        let version = self.config.bundle_version()?;
        let asset_hash = self
            .config
            .asset_hash
            .as_deref()
            .ok_or_else(|| Error::NotFound("asset hash, the cache was never updated".into()))?;
        Ok(format!(
            "{host}/{version}/{asset_hash}/{}/{}",
            self.config.app_platform, entry.bundle_name
        ))
    }

    /// The body of a bundle as served, still obfuscated.
    pub fn open_raw(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        let url = self.download_url(self.get_entry(name)?)?;
        let mut headers = client::default_headers(&self.config);
        if let Some(cookie) = &self.database.cookie {
            headers.push(("cookie", cookie.clone()));
        }
        tracing::debug!("downloading {url}");
        self.transport.open(&ApiRequest {
            method: Method::Get,
            url,
            headers,
            body: None,
        })
    }
}

impl BundleResolver for AssetBundleCache {
    fn bundles(&self) -> Vec<(String, u64)> {
        match &self.database.index {
            Some(index) => index
                .bundles
                .iter()
                .map(|(name, entry)| (name.clone(), entry.file_size))
                .collect(),
            None => Vec::new(),
        }
    }

    fn open_bundle(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        let raw = self.open_raw(name)?;
        Ok(Box::new(DecryptingReader::new(raw, BUNDLE_STREAM_BLOCK)))
    }

    fn contains(&self, name: &str) -> bool {
        self.database
            .index
            .as_ref()
            .is_some_and(|index| index.bundles.contains_key(name))
    }
}
