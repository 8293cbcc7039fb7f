use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::form_urlencoded;

use crate::config::DaemonConfig;
use crate::services::restart::{RestartHandle, RestartReason};

pub const DEFAULT_GROUP: &str = "DEFAULT_GROUP";
const DEFAULT_PORT: u16 = 8848;
const LONG_POLL_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum NacosError {
    #[error("invalid uri {0}")]
    Uri(String),

    #[error("http request to {server} failed: {reason}")]
    Transport { server: String, reason: String },

    #[error("nacos {server} returned {status}: {body}")]
    Status {
        server: String,
        status: StatusCode,
        body: String,
    },

    #[error("no nacos server configured")]
    NoServer,
}

/// Nacos 服务注册与配置监听（open api）
pub struct NacosClient {
    servers: Vec<String>,
    namespace_id: String,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl NacosClient {
    /// 未配置服务端地址时返回 None
    pub fn new(cfg: &DaemonConfig) -> Option<Self> {
        if cfg.ip_addrs.is_empty() {
            return None;
        }
        let servers = cfg.ip_addrs.iter().map(|addr| base_url(addr)).collect();
        Some(Self {
            servers,
            namespace_id: cfg.namespace_id.clone(),
            client: Client::builder(TokioExecutor::new()).build_http(),
        })
    }

    /// 注册本机实例
    pub async fn register_instance(&self, host_name: &str, rasp_version: &str) -> Result<(), NacosError> {
        let metadata = serde_json::json!({ "raspVersion": rasp_version }).to_string();
        let form = form_urlencoded::Serializer::new(String::new())
            .append_pair("serviceName", host_name)
            .append_pair("ip", host_name)
            .append_pair("port", &DEFAULT_PORT.to_string())
            .append_pair("namespaceId", &self.namespace_id)
            .append_pair("groupName", DEFAULT_GROUP)
            .append_pair("clusterName", "DEFAULT")
            .append_pair("weight", "10")
            .append_pair("enabled", "true")
            .append_pair("healthy", "true")
            // 非临时实例，不需要客户端心跳
            .append_pair("ephemeral", "false")
            .append_pair("metadata", &metadata)
            .finish();

        self.send(Method::POST, "/v1/ns/instance", &form, None, REQUEST_TIMEOUT)
            .await
            .map(|_| ())
    }

    /// 获取配置内容，不存在时返回 None
    pub async fn get_config(&self, data_id: &str) -> Result<Option<String>, NacosError> {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("dataId", data_id)
            .append_pair("group", DEFAULT_GROUP)
            .append_pair("tenant", &self.namespace_id)
            .finish();
        let path = format!("/v1/cs/configs?{}", query);
        match self.send(Method::GET, &path, "", None, REQUEST_TIMEOUT).await {
            Ok(body) => Ok(Some(body)),
            Err(NacosError::Status { status, .. }) if status == StatusCode::NOT_FOUND => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// 长轮询一次，配置有变化时返回 true
    async fn listen_once(&self, data_id: &str, content_md5: &str) -> Result<bool, NacosError> {
        let listening = listening_configs(data_id, DEFAULT_GROUP, content_md5, &self.namespace_id);
        let form = form_urlencoded::Serializer::new(String::new())
            .append_pair("Listening-Configs", &listening)
            .finish();
        let body = self
            .send(
                Method::POST,
                "/v1/cs/configs/listener",
                &form,
                Some(LONG_POLL_TIMEOUT),
                LONG_POLL_TIMEOUT + REQUEST_TIMEOUT,
            )
            .await?;
        Ok(!body.trim().is_empty())
    }

    /// 监听配置变化，返回新的配置内容；取消时返回 None
    pub async fn watch_config(&self, data_id: &str, cancel: &CancellationToken) -> Option<String> {
        let mut current_md5 = loop {
            let fetched = tokio::select! {
                _ = cancel.cancelled() => return None,
                r = self.get_config(data_id) => r,
            };
            match fetched {
                Ok(content) => break content_md5(content.as_deref().unwrap_or("")),
                Err(e) => {
                    log::warn!("[nacos] get config {} failed: {}", data_id, e);
                    if !backoff(cancel).await {
                        return None;
                    }
                }
            }
        };

        log::info!("[nacos] listen config dataId={} group={}", data_id, DEFAULT_GROUP);
        loop {
            let changed = tokio::select! {
                _ = cancel.cancelled() => return None,
                r = self.listen_once(data_id, &current_md5) => r,
            };
            let result = match changed {
                Ok(false) => continue,
                Ok(true) => self.get_config(data_id).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(Some(content)) => {
                    let md5 = content_md5(&content);
                    if md5 != current_md5 {
                        return Some(content);
                    }
                    current_md5 = md5;
                }
                Ok(None) => current_md5 = content_md5(""),
                Err(e) => {
                    log::warn!("[nacos] listen config {} failed: {}", data_id, e);
                    if !backoff(cancel).await {
                        return None;
                    }
                }
            }
        }
    }

    /// 依次尝试每个服务端，返回第一个成功的响应体
    async fn send(
        &self,
        method: Method,
        path: &str,
        form: &str,
        long_poll: Option<Duration>,
        timeout: Duration,
    ) -> Result<String, NacosError> {
        let mut last_err = NacosError::NoServer;
        for server in &self.servers {
            match self
                .send_to(server, method.clone(), path, form, long_poll, timeout)
                .await
            {
                Ok(body) => return Ok(body),
                // 4xx 换一个服务端也一样
                Err(e @ NacosError::Status { .. }) => return Err(e),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    async fn send_to(
        &self,
        server: &str,
        method: Method,
        path: &str,
        form: &str,
        long_poll: Option<Duration>,
        timeout: Duration,
    ) -> Result<String, NacosError> {
        let url = format!("{}{}", server, path);
        let uri: Uri = url.parse().map_err(|_| NacosError::Uri(url.clone()))?;
        let transport = |reason: String| NacosError::Transport {
            server: server.to_string(),
            reason,
        };

        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/x-www-form-urlencoded");
        if let Some(poll) = long_poll {
            builder = builder.header("Long-Pulling-Timeout", poll.as_millis().to_string());
        }
        let req = builder
            .body(Full::new(Bytes::from(form.to_string())))
            .map_err(|e| transport(e.to_string()))?;

        let resp = match tokio::time::timeout(timeout, self.client.request(req)).await {
            Ok(resp) => resp.map_err(|e| transport(e.to_string()))?,
            Err(_) => return Err(transport(format!("timed out after {:?}", timeout))),
        };
        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| transport(e.to_string()))?
            .to_bytes();
        let body = String::from_utf8_lossy(&bytes).into_owned();

        if status.is_success() {
            Ok(body)
        } else {
            Err(NacosError::Status {
                server: server.to_string(),
                status,
                body,
            })
        }
    }
}

async fn backoff(cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(RETRY_BACKOFF) => true,
    }
}

fn base_url(addr: &str) -> String {
    let addr = addr.trim_end_matches('/');
    let addr = addr.strip_prefix("http://").unwrap_or(addr);
    if addr.contains(':') {
        format!("http://{}/nacos", addr)
    } else {
        format!("http://{}:{}/nacos", addr, DEFAULT_PORT)
    }
}

fn content_md5(content: &str) -> String {
    if content.is_empty() {
        return String::new();
    }
    format!("{:x}", md5::compute(content.as_bytes()))
}

/// dataId^2group^2md5^2tenant^1
fn listening_configs(data_id: &str, group: &str, md5: &str, tenant: &str) -> String {
    let mut s = format!("{}\u{2}{}\u{2}{}", data_id, group, md5);
    if !tenant.is_empty() {
        s.push('\u{2}');
        s.push_str(tenant);
    }
    s.push('\u{1}');
    s
}

/// 远程配置的变更来源
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// 等待下一次配置变更，取消时返回 None
    async fn next_change(&self, data_id: &str, cancel: &CancellationToken) -> Option<String>;
}

#[async_trait]
impl ConfigSource for NacosClient {
    async fn next_change(&self, data_id: &str, cancel: &CancellationToken) -> Option<String> {
        self.watch_config(data_id, cancel).await
    }
}

/// 持续监听配置，直到某次变更被接受或收到取消信号。
/// 被拒绝的配置成为新的基线，之后的修正仍会被处理。
pub async fn follow_config<S>(
    source: &S,
    data_id: &str,
    config_path: &Path,
    restart: &RestartHandle,
    cancel: &CancellationToken,
) where
    S: ConfigSource + ?Sized,
{
    while let Some(raw) = source.next_change(data_id, cancel).await {
        match on_config_changed(&raw, config_path, restart) {
            Ok(()) => return,
            Err(e) => log::error!("[nacos] apply config update failed: {:#}", e),
        }
    }
    log::info!("[nacos] config listener stopped");
}

/// 配置变化：校验并写入本地配置文件，然后请求重启
pub fn on_config_changed(raw: &str, config_path: &Path, restart: &RestartHandle) -> anyhow::Result<()> {
    use anyhow::Context;

    log::info!("[nacos] config update received, {} bytes", raw.len());
    DaemonConfig::from_json(raw).context("remote config rejected")?;
    write_private(config_path, raw.as_bytes())
        .with_context(|| format!("write {}", config_path.display()))?;

    log::info!("[nacos] config update, rasp-daemon will exit(0)...");
    restart.request(RestartReason::ConfigChanged);
    Ok(())
}

#[cfg(unix)]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)
}

#[cfg(not(unix))]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, data)
}
