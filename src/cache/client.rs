//! Blocking client for the game API.

use std::io::{self, Read};
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::crypto::ManifestCipher;
use crate::error::{Error, Result};

use super::config::{CacheConfig, Endpoints, expand_host};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Carries requests to the backend.
pub trait Transport: Send + Sync {
    fn execute(&self, request: &ApiRequest) -> Result<ApiResponse>;

    /// Streams a response body, failing on non-success statuses.
    fn open(&self, request: &ApiRequest) -> Result<Box<dyn Read + Send>>;
}

/// [`Transport`] over a `reqwest` blocking client.
pub struct HttpTransport {
    client: Client,
}

fn http_error(e: reqwest::Error) -> Error {
    Error::Io(io::Error::other(e))
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(http_error)?;
        Ok(HttpTransport { client })
    }

    fn send(&self, request: &ApiRequest) -> Result<reqwest::blocking::Response> {
        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            // negotiated by the client, which then also decompresses
            if name.eq_ignore_ascii_case("accept-encoding") {
                continue;
            }
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::invalid(format!("header {name}: {e}")))?;
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::invalid(format!("header {name}: {e}")))?;
            headers.insert(name, value);
        }
        let builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
            Method::Put => self.client.put(&request.url),
        };
        let builder = builder.headers(headers);
        let builder = match &request.body {
            Some(body) => builder.body(body.clone()),
            None => builder,
        };
        builder.send().map_err(http_error)
    }
}

impl Transport for HttpTransport {
    fn execute(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let response = self.send(request)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| Some((name.to_string(), value.to_str().ok()?.to_owned())))
            .collect();
        let body = response.bytes().map_err(http_error)?.to_vec();
        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }

    fn open(&self, request: &ApiRequest) -> Result<Box<dyn Read + Send>> {
        let response = self.send(request)?;
        if !response.status().is_success() {
            return Err(Error::HttpError {
                status: response.status().as_u16(),
                url: request.url.clone(),
            });
        }
        Ok(Box::new(response))
    }
}

/// Looks up a string-keyed field of a message-pack map.
pub fn field<'a>(value: &'a rmpv::Value, key: &str) -> Option<&'a rmpv::Value> {
    value
        .as_map()?
        .iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

/// A string or integer field, as text.
pub fn field_string(value: &rmpv::Value, key: &str) -> Option<String> {
    let field = field(value, key)?;
    if let Some(text) = field.as_str() {
        return Some(text.to_owned());
    }
    field
        .as_u64()
        .map(|n| n.to_string())
        .or_else(|| field.as_i64().map(|n| n.to_string()))
}

/// Headers sent with every request, API or asset.
pub fn default_headers(config: &CacheConfig) -> Vec<(&'static str, String)> {
    let platform = config.app_platform.header_value();
    vec![
        ("accept", "application/octet-stream".to_owned()),
        ("content-type", "application/octet-stream".to_owned()),
        ("accept-encoding", "deflate, gzip".to_owned()),
        ("user-agent", format!("UnityPlayer/{}", config.unity_version)),
        ("x-platform", platform.to_owned()),
        ("x-devicemodel", config.device_model.clone()),
        ("x-operatingsystem", platform.to_owned()),
        ("x-unity-version", config.unity_version.clone()),
        ("x-app-version", config.app_version.clone()),
        ("x-app-hash", config.app_hash.clone()),
    ]
}

/// Session state of one conversation with the API.
pub struct ApiClient<'a> {
    transport: &'a dyn Transport,
    config: &'a CacheConfig,
    endpoints: Endpoints,
    cipher: ManifestCipher,
    cookie: Option<String>,
    session_token: Option<String>,
}

impl<'a> ApiClient<'a> {
    pub fn new(transport: &'a dyn Transport, config: &'a CacheConfig) -> Result<Self> {
        Ok(ApiClient {
            transport,
            config,
            endpoints: config.endpoints()?,
            cipher: config.cipher()?,
            cookie: None,
            session_token: None,
        })
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn cookie(&self) -> Option<&str> {
        self.cookie.as_deref()
    }

    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = default_headers(self.config);
        if let Some(cookie) = &self.cookie {
            headers.push(("cookie", cookie.clone()));
        }
        if let Some(token) = &self.session_token {
            headers.push(("x-session-token", token.clone()));
        }
        headers
    }

    pub fn request(&self, method: Method, url: String, body: Option<Vec<u8>>) -> ApiRequest {
        ApiRequest {
            method,
            url,
            headers: self.headers(),
            body,
        }
    }

    fn execute(&mut self, request: ApiRequest) -> Result<ApiResponse> {
        tracing::debug!("{:?} {}", request.method, request.url);
        let response = self.transport.execute(&request)?;
        if let Some(token) = response.header("x-session-token") {
            self.session_token = Some(token.to_owned());
        }
        match response.status {
            _ if response.is_success() => Ok(response),
            401 | 403 => Err(Error::AuthFailed(format!(
                "{} rejected with status {}",
                request.url, response.status
            ))),
            status => Err(Error::HttpError {
                status,
                url: request.url,
            }),
        }
    }

    fn execute_packed(
        &mut self,
        method: Method,
        url: String,
        body: Option<&rmpv::Value>,
    ) -> Result<rmpv::Value> {
        let body = body.map(|body| self.cipher.pack(body)).transpose()?;
        let request = self.request(method, url, body);
        let response = self.execute(request)?;
        self.cipher.unpack_value(&response.body)
    }

    /// Acquires the signature cookie. A no-op for regions without an issuer.
    pub fn issue_signature(&mut self) -> Result<()> {
        let Some(issuer) = self.endpoints.signature.clone() else {
            return Ok(());
        };
        let request = self.request(Method::Post, format!("{issuer}/api/signature"), None);
        let response = self.execute(request)?;
        let cookie = response
            .header("set-cookie")
            .ok_or_else(|| Error::AuthFailed("signature response carries no cookie".into()))?;
        self.cookie = Some(cookie.to_owned());
        Ok(())
    }

    pub fn game_version(&mut self) -> Result<rmpv::Value> {
        let url = format!(
            "{}/{}/{}",
            self.endpoints.game_version, self.config.app_version, self.config.app_hash
        );
        self.execute_packed(Method::Get, url, None)
    }

    /// Registers an anonymous user. Returns the registration response.
    pub fn register(&mut self) -> Result<rmpv::Value> {
        let platform = self.config.app_platform.header_value();
        let body = rmpv::Value::Map(vec![
            ("platform".into(), platform.into()),
            ("deviceModel".into(), self.config.device_model.as_str().into()),
            ("operatingSystem".into(), platform.into()),
        ]);
        let url = format!("{}/api/user", self.endpoints.api);
        self.execute_packed(Method::Post, url, Some(&body))
    }

    pub fn authenticate(&mut self, user_id: &str, credential: &str) -> Result<rmpv::Value> {
        let body = rmpv::Value::Map(vec![
            ("credential".into(), credential.into()),
            ("deviceId".into(), rmpv::Value::Nil),
        ]);
        let url = format!(
            "{}/api/user/{user_id}/auth?refreshUpdatedResources=False",
            self.endpoints.api
        );
        let auth = self.execute_packed(Method::Put, url, Some(&body))?;
        if let Some(token) = field_string(&auth, "sessionToken") {
            self.session_token = Some(token);
        }
        if self.session_token.is_none() {
            return Err(Error::AuthFailed(format!("no session token for user {user_id}")));
        }
        Ok(auth)
    }

    pub fn system(&mut self) -> Result<rmpv::Value> {
        let url = format!("{}/api/system", self.endpoints.api);
        self.execute_packed(Method::Get, url, None)
    }

    /// Fetches the manifest index body, still encrypted.
    pub fn asset_index(&mut self, host_hash: Option<&str>, version: &str) -> Result<Vec<u8>> {
        let host = expand_host(&self.endpoints.assetbundle_info, host_hash)?;
        let url = format!(
            "{host}/api/version/{version}/os/{}",
            self.config.app_platform
        );
        let request = self.request(Method::Get, url, None);
        Ok(self.execute(request)?.body)
    }

    pub fn cipher(&self) -> &ManifestCipher {
        &self.cipher
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Region;

    #[test]
    fn required_headers() {
        let mut config = CacheConfig::new(Region::Jp, "5.1.0", "0123abcd");
        config.unity_version = "2022.3.21f1".into();
        let transport = HttpTransport::new().unwrap();
        let client = ApiClient::new(&transport, &config).unwrap();
        let headers = client.headers();
        let get = |name: &str| {
            headers
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.as_str())
        };
        assert_eq!(get("user-agent"), Some("UnityPlayer/2022.3.21f1"));
        assert_eq!(get("x-unity-version"), Some("2022.3.21f1"));
        assert_eq!(get("x-app-version"), Some("5.1.0"));
        assert_eq!(get("x-app-hash"), Some("0123abcd"));
        assert_eq!(get("x-platform"), Some("Android"));
        assert_eq!(get("accept"), Some("application/octet-stream"));
        assert_eq!(get("x-session-token"), None);
        assert!(headers.iter().all(|(name, _)| name.chars().all(|c| !c.is_ascii_uppercase())));
    }

    #[test]
    fn invalid_header_names_are_errors() {
        let transport = HttpTransport::new().unwrap();
        let request = ApiRequest {
            method: Method::Get,
            url: "http://127.0.0.1:9/".into(),
            headers: vec![("bad header", "x".into())],
            body: None,
        };
        assert!(matches!(
            transport.execute(&request),
            Err(Error::InvalidData(_))
        ));
    }

    #[test]
    fn message_pack_fields() {
        let value = rmpv::Value::Map(vec![
            ("userId".into(), 1234567u64.into()),
            ("credential".into(), "secret".into()),
        ]);
        assert_eq!(field_string(&value, "userId").as_deref(), Some("1234567"));
        assert_eq!(field_string(&value, "credential").as_deref(), Some("secret"));
        assert_eq!(field(&value, "missing"), None);
        assert_eq!(field(&rmpv::Value::Nil, "userId"), None);
    }
}
