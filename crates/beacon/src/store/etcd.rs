//! etcd v2 keys API client.
//!
//! Every request is tried against the configured endpoints in turn. A
//! transport failure or 5xx answer moves on to the next endpoint; when all of
//! them fail the caller gets [`StoreError::Transient`] listing each failure.

use async_trait::async_trait;
use beacon_common::constants::etcd;
use beacon_common::{KeyEvent, StoreError};
use rand::seq::SliceRandom;
use reqwest::{Method, Response, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use super::{DeleteOptions, KeyStore, PrevExist, SetOptions, WatchOptions, Watcher, ttl_secs};
use crate::config::AppConfig;
use beacon_common::BeaconError;

/// Error body returned by etcd for failed requests
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiError {
    #[serde(default)]
    error_code: u32,
    #[serde(default)]
    message: String,
    #[serde(default)]
    cause: String,
    #[serde(default)]
    index: u64,
}

impl ApiError {
    fn into_store_error(self, key: &str, header_index: u64) -> StoreError {
        let index = self.index.max(header_index);
        match self.error_code {
            etcd::ERR_KEY_NOT_FOUND => StoreError::KeyNotFound {
                key: key.to_string(),
                index,
            },
            etcd::ERR_TEST_FAILED => StoreError::PreconditionFailed {
                key: key.to_string(),
                cause: self.cause,
            },
            etcd::ERR_NODE_EXIST => StoreError::NodeExists {
                key: key.to_string(),
            },
            etcd::ERR_UNAUTHORIZED => StoreError::Unauthorized(self.message),
            etcd::ERR_RAFT_INTERNAL | etcd::ERR_LEADER_ELECT => {
                StoreError::Transient(format!("{} ({})", self.message, self.cause))
            }
            etcd::ERR_EVENT_INDEX_CLEARED => StoreError::IndexCleared {
                key: key.to_string(),
                index,
            },
            code => StoreError::Api {
                code,
                key: key.to_string(),
                message: self.message,
            },
        }
    }
}

struct EtcdInner {
    http: reqwest::Client,
    endpoints: Vec<String>,
    credentials: Option<(String, String)>,
    request_timeout: Duration,
}

/// etcd v2 client (cheap to clone)
#[derive(Clone)]
pub struct EtcdClient {
    inner: Arc<EtcdInner>,
}

impl EtcdClient {
    /// Build a client from the loaded configuration
    pub fn connect(config: &AppConfig) -> Result<Self, BeaconError> {
        let mut endpoints: Vec<String> = config
            .peers
            .iter()
            .map(|p| p.trim().trim_end_matches('/').to_string())
            .filter(|p| !p.is_empty())
            .collect();
        if endpoints.is_empty() {
            return Err(BeaconError::Config("no etcd peers configured".into()));
        }
        endpoints.shuffle(&mut rand::rng());

        let ca_path = config.ca_cert.as_ref().ok_or_else(|| {
            BeaconError::Config("a CA certificate is required (--cacert)".into())
        })?;
        let pem = std::fs::read(ca_path).map_err(|e| {
            BeaconError::Config(format!("failed to read CA certificate {}: {e}", ca_path.display()))
        })?;
        let certs = reqwest::Certificate::from_pem_bundle(&pem).map_err(|e| {
            BeaconError::Config(format!("invalid CA certificate {}: {e}", ca_path.display()))
        })?;

        let mut builder = reqwest::Client::builder().use_rustls_tls();
        for cert in certs {
            builder = builder.add_root_certificate(cert);
        }
        let http = builder
            .build()
            .map_err(|e| BeaconError::Config(format!("failed to build HTTP client: {e}")))?;

        let credentials = match (&config.username, &config.password) {
            (Some(user), pass) if !user.is_empty() => {
                Some((user.clone(), pass.clone().unwrap_or_default()))
            }
            _ => None,
        };

        tracing::debug!(endpoints = ?endpoints, auth = credentials.is_some(), "etcd client ready");

        Ok(Self {
            inner: Arc::new(EtcdInner {
                http,
                endpoints,
                credentials,
                request_timeout: Duration::from_secs(config.request_timeout_secs),
            }),
        })
    }

    async fn request(
        &self,
        method: Method,
        key: &str,
        query: &[(&str, String)],
        form: &[(&str, String)],
        wait: bool,
    ) -> Result<KeyEvent, StoreError> {
        let path = key_path(key);
        let mut failures = Vec::new();

        for endpoint in &self.inner.endpoints {
            let url = format!("{}{}{}", endpoint, etcd::KEYS_PATH, path);
            let mut req = self.inner.http.request(method.clone(), &url).query(query);
            if !form.is_empty() {
                req = req.form(form);
            }
            if let Some((user, pass)) = &self.inner.credentials {
                req = req.basic_auth(user, Some(pass));
            }
            if !wait {
                req = req.timeout(self.inner.request_timeout);
            }

            match req.send().await {
                Ok(resp) if resp.status().is_server_error() => {
                    tracing::debug!(endpoint = %endpoint, status = %resp.status(), "etcd endpoint failed");
                    failures.push(format!("{}: HTTP {}", endpoint, resp.status()));
                }
                Ok(resp) => return decode(key, resp).await,
                Err(e) => {
                    tracing::debug!(endpoint = %endpoint, error = %e, "etcd endpoint unreachable");
                    failures.push(format!("{}: {}", endpoint, e));
                }
            }
        }

        Err(StoreError::Transient(failures.join("; ")))
    }
}

#[async_trait]
impl KeyStore for EtcdClient {
    type Watcher = EtcdWatcher;

    async fn get(&self, key: &str, recursive: bool) -> Result<KeyEvent, StoreError> {
        let query = [("recursive", recursive.to_string())];
        self.request(Method::GET, key, &query, &[], false).await
    }

    async fn set(&self, key: &str, value: &str, opts: &SetOptions) -> Result<KeyEvent, StoreError> {
        let mut form = vec![("value", value.to_string())];
        if let Some(ttl) = opts.ttl {
            form.push(("ttl", ttl_secs(ttl).to_string()));
        }
        match opts.prev_exist {
            PrevExist::Ignore => {}
            PrevExist::Exists => form.push(("prevExist", "true".into())),
            PrevExist::Absent => form.push(("prevExist", "false".into())),
        }
        if let Some(prev) = &opts.prev_value {
            form.push(("prevValue", prev.clone()));
        }
        self.request(Method::PUT, key, &[], &form, false).await
    }

    async fn delete(&self, key: &str, opts: &DeleteOptions) -> Result<KeyEvent, StoreError> {
        let mut query = Vec::new();
        if let Some(prev) = &opts.prev_value {
            query.push(("prevValue", prev.clone()));
        }
        if opts.recursive {
            query.push(("recursive", "true".into()));
        }
        self.request(Method::DELETE, key, &query, &[], false).await
    }

    fn watcher(&self, key: &str, opts: WatchOptions) -> EtcdWatcher {
        EtcdWatcher {
            client: self.clone(),
            key: key.to_string(),
            recursive: opts.recursive,
            wait_index: (opts.after_index > 0).then(|| opts.after_index + 1),
        }
    }
}

/// Long-polling watch (`wait=true`) that advances past each delivered event
pub struct EtcdWatcher {
    client: EtcdClient,
    key: String,
    recursive: bool,
    wait_index: Option<u64>,
}

#[async_trait]
impl Watcher for EtcdWatcher {
    async fn next(&mut self) -> Result<KeyEvent, StoreError> {
        let mut query = vec![
            ("wait", "true".to_string()),
            ("recursive", self.recursive.to_string()),
        ];
        if let Some(index) = self.wait_index {
            query.push(("waitIndex", index.to_string()));
        }

        let event = self
            .client
            .request(Method::GET, &self.key, &query, &[], true)
            .await?;
        self.wait_index = Some(event.node.modified_index + 1);
        Ok(event)
    }
}

/// URL path for a key with each segment percent-encoded
fn key_path(key: &str) -> String {
    key.split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| format!("/{}", urlencoding::encode(segment)))
        .collect()
}

async fn decode(key: &str, resp: Response) -> Result<KeyEvent, StoreError> {
    let status = resp.status();
    let header_index = resp
        .headers()
        .get(etcd::INDEX_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    let body = resp
        .bytes()
        .await
        .map_err(|e| StoreError::Transient(format!("response body interrupted: {e}")))?;
    if body.is_empty() {
        return Err(StoreError::Transient("empty response body".into()));
    }

    parse_body(key, status, header_index, &body)
}

fn parse_body(
    key: &str,
    status: StatusCode,
    header_index: u64,
    body: &[u8],
) -> Result<KeyEvent, StoreError> {
    if status.is_success() {
        let mut event: KeyEvent = serde_json::from_slice(body)
            .map_err(|e| StoreError::Protocol(format!("invalid event JSON: {e}")))?;
        event.index = header_index;
        return Ok(event);
    }

    let error: ApiError = serde_json::from_slice(body).map_err(|_| {
        StoreError::Protocol(format!(
            "HTTP {}: {}",
            status,
            String::from_utf8_lossy(body)
        ))
    })?;

    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) && error.error_code == 0 {
        return Err(StoreError::Unauthorized(error.message));
    }

    Err(error.into_store_error(key, header_index))
}
