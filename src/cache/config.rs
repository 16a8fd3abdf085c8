use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::str::FromStr;

use anyhow::Context as _;
use serde_derive::{Deserialize, Serialize};

use crate::crypto::{Keyset, ManifestCipher};
use crate::error::{Error, Result};

/// Engine version assumed when the config does not name one.
pub const DEFAULT_UNITY_VERSION: &str = "2022.3.21f1";
pub const HOST_HASH_PLACEHOLDER: &str = "{hostHash}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    #[default]
    Jp,
    En,
    Tw,
    Kr,
    Cn,
}

impl Region {
    pub const ALL: [Region; 5] = [Region::Jp, Region::En, Region::Tw, Region::Kr, Region::Cn];

    pub fn as_str(self) -> &'static str {
        match self {
            Region::Jp => "jp",
            Region::En => "en",
            Region::Tw => "tw",
            Region::Kr => "kr",
            Region::Cn => "cn",
        }
    }

    /// Regions other than JP register and version their bundles separately.
    pub fn is_row(self) -> bool {
        self != Region::Jp
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Region {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Region::ALL
            .into_iter()
            .find(|region| region.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::invalid(format!("unknown region '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    Android,
    Ios,
}

impl Platform {
    /// Path segment in asset URLs.
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Android => "android",
            Platform::Ios => "ios",
        }
    }

    /// Value of the `X-Platform` and `X-OperatingSystem` headers.
    pub fn header_value(self) -> &'static str {
        match self {
            Platform::Android => "Android",
            Platform::Ios => "iOS",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "android" => Ok(Platform::Android),
            "ios" => Ok(Platform::Ios),
            _ => Err(Error::invalid(format!("unknown platform '{s}'"))),
        }
    }
}

/// Hosts of the game backend. Templates may contain `{hostHash}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoints {
    pub api: String,
    pub game_version: String,
    /// Issues the signature cookie. Only JP has one.
    #[serde(default)]
    pub signature: Option<String>,
    pub assetbundle_info: String,
    pub assetbundle: String,
}

impl Endpoints {
    pub fn builtin(region: Region) -> Option<Endpoints> {
        match region {
            Region::Jp => Some(Endpoints {
                api: "https://production-game-api.sekai.colorfulpalette.org".into(),
                game_version: "https://game-version.sekai.colorfulpalette.org".into(),
                signature: Some("https://issue.sekai.colorfulpalette.org".into()),
                assetbundle_info:
                    "https://production-{hostHash}-assetbundle-info.sekai.colorfulpalette.org"
                        .into(),
                assetbundle: "https://production-{hostHash}-assetbundle.sekai.colorfulpalette.org"
                    .into(),
            }),
            Region::En => Some(Endpoints {
                api: "https://n-production-game-api.sekai-en.com".into(),
                game_version: "https://game-version.sekai-en.com".into(),
                signature: None,
                assetbundle_info: "https://assetbundle-info.sekai-en.com".into(),
                assetbundle: "https://assetbundle.sekai-en.com".into(),
            }),
            Region::Tw | Region::Kr | Region::Cn => None,
        }
    }
}

/// Substitutes the host hash into an endpoint template.
pub fn expand_host(template: &str, host_hash: Option<&str>) -> Result<String> {
    if !template.contains(HOST_HASH_PLACEHOLDER) {
        return Ok(template.to_owned());
    }
    let host_hash = host_hash
        .ok_or_else(|| Error::NotFound(format!("host hash required by '{template}'")))?;
    Ok(template.replace(HOST_HASH_PLACEHOLDER, host_hash))
}

/// A hex-encoded AES key and IV.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysetConfig {
    pub key: String,
    pub iv: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    pub region: Region,
    pub app_version: String,
    #[serde(default)]
    pub app_platform: Platform,
    pub app_hash: String,
    /// Bundle version of the non-JP regions.
    #[serde(default)]
    pub ab_version: Option<String>,
    #[serde(default)]
    pub asset_hash: Option<String>,
    #[serde(default)]
    pub asset_version: Option<String>,
    #[serde(default)]
    pub host_hash: Option<String>,
    #[serde(default)]
    pub auth_credential: Option<String>,
    #[serde(default)]
    pub auth_user_id: Option<String>,
    #[serde(default = "default_unity_version")]
    pub unity_version: String,
    #[serde(default = "default_device_model")]
    pub device_model: String,
    #[serde(default)]
    pub endpoints: Option<Endpoints>,
    #[serde(default)]
    pub keyset: Option<KeysetConfig>,
}

fn default_unity_version() -> String {
    DEFAULT_UNITY_VERSION.to_owned()
}

fn default_device_model() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig::new(Region::default(), "", "")
    }
}

impl CacheConfig {
    pub fn new(region: Region, app_version: &str, app_hash: &str) -> Self {
        CacheConfig {
            region,
            app_version: app_version.to_owned(),
            app_platform: Platform::default(),
            app_hash: app_hash.to_owned(),
            ab_version: None,
            asset_hash: None,
            asset_version: None,
            host_hash: None,
            auth_credential: None,
            auth_user_id: None,
            unity_version: default_unity_version(),
            device_model: default_device_model(),
            endpoints: None,
            keyset: None,
        }
    }

    pub fn from_reader(reader: impl Read) -> anyhow::Result<Self> {
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("could not open {}", path.display()))?;
        CacheConfig::from_reader(BufReader::new(file))
            .with_context(|| format!("malformed cache config {}", path.display()))
    }

    /// Configured endpoints, or the region's defaults.
    pub fn endpoints(&self) -> Result<Endpoints> {
        self.endpoints
            .clone()
            .or_else(|| Endpoints::builtin(self.region))
            .ok_or_else(|| {
                Error::NotFound(format!("no endpoints configured for region {}", self.region))
            })
    }

    pub fn cipher(&self) -> Result<ManifestCipher> {
        let keyset = match &self.keyset {
            Some(KeysetConfig { key, iv }) => Some(Keyset::from_hex(key, iv)?),
            None => None,
        };
        ManifestCipher::for_region(self.region, keyset)
    }

    /// Version segment of asset URLs.
    pub fn bundle_version(&self) -> Result<&str> {
        let version = match self.region.is_row() {
            true => self.ab_version.as_deref().or(self.asset_version.as_deref()),
            false => self.asset_version.as_deref(),
        };
        version.ok_or_else(|| Error::NotFound("asset version, the cache was never updated".into()))
    }
}
