//! 外部查询客户端
//!
//! 将挑战/用户两个 REST 资源的查询封装为统一接口，
//! 并通过 trait 抽象以支持单元测试中的 stub 注入。
//! m2m token 通过显式的 `TokenCache` 组件缓存，未过期时跨调用复用。

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use corona_shared::config::ApiConfig;
use corona_shared::error::{RelayError, Result};

// ---------------------------------------------------------------------------
// Trait 抽象 — 便于测试时替换为 stub 实现
// ---------------------------------------------------------------------------

/// 外部查询接口
///
/// 所有方法返回响应包装 `{result: {status, content}}` 中的 content 部分。
/// id/handle 为空时返回 `MissingId`（参数校验错误），
/// 远程返回非 2xx 包装状态时返回 `Remote`（携带远程状态和内容）。
#[async_trait]
pub trait LookupApi: Send + Sync {
    /// 获取 m2m token，同一 handler 内多次调用复用
    async fn get_token(&self) -> Result<String>;

    /// 按 id 查询挑战详情；`token` 为 None 时客户端自取
    async fn get_challenge(&self, challenge_id: &str, token: Option<&str>) -> Result<Value>;

    /// 按 id 查询用户详情（content 为数组）；`token` 为 None 时客户端自取
    async fn get_user(&self, member_id: &str, token: Option<&str>) -> Result<Value>;

    /// 按 handle 查询用户公开资料，无需认证
    async fn get_user_by_handle(&self, handle: &str) -> Result<Value>;
}

// ---------------------------------------------------------------------------
// TokenCache — 短生命周期 token 缓存
// ---------------------------------------------------------------------------

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// m2m token 缓存
///
/// 持有单个 token 槽位和过期时刻，到期前 `leeway` 提前刷新。
/// 作为独立组件注入查询客户端，而非藏在模块级单例里。
pub struct TokenCache {
    slot: Mutex<Option<CachedToken>>,
    leeway: Duration,
}

impl TokenCache {
    pub fn new(leeway: Duration) -> Self {
        Self {
            slot: Mutex::new(None),
            leeway,
        }
    }

    /// 返回缓存中未过期的 token，否则执行 `fetch` 换取新 token 并缓存
    ///
    /// `fetch` 返回 (token, 有效期)；缓存的过期时刻会减去 leeway，
    /// 避免拿到临近过期的 token 去调用远程 API。
    pub async fn get_or_refresh<F, Fut>(&self, fetch: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(String, Duration)>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some(cached) = slot.as_ref()
            && Instant::now() < cached.expires_at
        {
            return Ok(cached.token.clone());
        }

        let (token, ttl) = fetch().await?;
        let expires_at = Instant::now() + ttl.saturating_sub(self.leeway);
        *slot = Some(CachedToken {
            token: token.clone(),
            expires_at,
        });
        debug!(ttl_seconds = ttl.as_secs(), "m2m token 已刷新");
        Ok(token)
    }
}

// ---------------------------------------------------------------------------
// LookupClient — REST 客户端实现
// ---------------------------------------------------------------------------

#[derive(serde::Serialize)]
struct TokenRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    audience: &'a str,
    grant_type: &'static str,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

/// 基于 reqwest 的查询客户端
///
/// 资源 URL 是带单个占位符的模板，查询时做字面子串替换，
/// 因此调用方需保证 id 中不含占位符本身。
pub struct LookupClient {
    http: reqwest::Client,
    config: ApiConfig,
    token_cache: TokenCache,
}

impl LookupClient {
    pub fn new(config: ApiConfig) -> Self {
        let token_cache = TokenCache::new(Duration::from_secs(config.token_leeway_seconds));
        Self {
            http: reqwest::Client::new(),
            config,
            token_cache,
        }
    }

    /// 执行 m2m client-credentials 交换
    async fn exchange_token(&self) -> Result<(String, Duration)> {
        let request = TokenRequest {
            client_id: &self.config.client_id,
            client_secret: &self.config.client_secret,
            audience: &self.config.auth_audience,
            grant_type: "client_credentials",
        };

        let response = self
            .http
            .post(&self.config.auth_url)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(RelayError::Auth(format!(
                "token 端点返回 {}",
                response.status()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| RelayError::Auth(format!("token 响应解析失败: {e}")))?;

        info!("m2m token 交换成功");
        Ok((body.access_token, Duration::from_secs(body.expires_in)))
    }

    /// GET 资源并拆开 `{result: {status, content}}` 包装
    async fn fetch(&self, api: &'static str, url: &str, token: Option<&str>) -> Result<Value> {
        let mut request = self.http.get(url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        // 错误响应同样携带包装结构，所以不看 HTTP 状态、直接解析响应体
        let body: Value = request.send().await?.json().await?;
        unwrap_result(api, body)
    }
}

/// 校验响应包装的 result.status 并取出 content
///
/// 包装状态在 [200,300) 之外时报 Remote 错误，携带远程状态和内容文本。
fn unwrap_result(api: &'static str, body: Value) -> Result<Value> {
    let status = body
        .pointer("/result/status")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u16;

    if !(200..300).contains(&status) {
        let content = body
            .pointer("/result/content")
            .map(content_text)
            .unwrap_or_default();
        return Err(RelayError::Remote {
            api,
            status,
            content,
        });
    }

    Ok(body
        .pointer("/result/content")
        .cloned()
        .unwrap_or(Value::Null))
}

fn content_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl LookupApi for LookupClient {
    async fn get_token(&self) -> Result<String> {
        self.token_cache
            .get_or_refresh(|| self.exchange_token())
            .await
    }

    async fn get_challenge(&self, challenge_id: &str, token: Option<&str>) -> Result<Value> {
        if challenge_id.is_empty() {
            return Err(RelayError::MissingId {
                field: "challenge id",
            });
        }
        let token = match token {
            Some(t) => t.to_string(),
            None => self.get_token().await?,
        };
        let url = self.config.challenge_url.replace("{challengeId}", challenge_id);
        debug!(challenge_id, "查询挑战详情");
        self.fetch("challenge details", &url, Some(&token)).await
    }

    async fn get_user(&self, member_id: &str, token: Option<&str>) -> Result<Value> {
        if member_id.is_empty() {
            return Err(RelayError::MissingId { field: "user id" });
        }
        let token = match token {
            Some(t) => t.to_string(),
            None => self.get_token().await?,
        };
        let url = self.config.user_url.replace("{memberId}", member_id);
        debug!(member_id, "查询用户详情");
        self.fetch("user details", &url, Some(&token)).await
    }

    async fn get_user_by_handle(&self, handle: &str) -> Result<Value> {
        if handle.is_empty() {
            return Err(RelayError::MissingId {
                field: "user handle",
            });
        }
        // 公开 API，不带认证
        let url = self.config.user_by_handle_url.replace("{handle}", handle);
        debug!(handle, "按 handle 查询用户资料");
        self.fetch("user details by handle", &url, None).await
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------
