//! HTTPS implementation of `ControlPlane`.

use std::sync::Mutex;

use async_trait::async_trait;
use relaygrid_core::config::PanelConfig;
use relaygrid_core::{Redactor, RetryPolicy, Secret, retry};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::ControlPlane;
use crate::error::{PanelError, PanelResult};
use crate::types::{NewNode, PanelCredentials, PanelNode, TokenResponse};

pub struct PanelClient {
    http: reqwest::Client,
    base_url: String,
    credentials: PanelCredentials,
    policy: RetryPolicy,
    token: Mutex<Option<Secret>>,
    redactor: Redactor,
}

impl PanelClient {
    pub fn new(
        config: &PanelConfig,
        credentials: PanelCredentials,
        policy: RetryPolicy,
    ) -> PanelResult<Self> {
        if config.insecure {
            warn!(url = %config.url, "panel TLS certificate verification disabled");
        }
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .danger_accept_invalid_certs(config.insecure)
            .build()
            .map_err(|e| PanelError::Build(e.to_string()))?;

        let redactor = Redactor::new().with(&credentials.password);
        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            credentials,
            policy,
            token: Mutex::new(None),
            redactor,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn cached_token(&self) -> Option<Secret> {
        self.token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn store_token(&self, token: Option<Secret>) {
        *self
            .token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = token;
    }

    /// Send with the bounded retry. Transport failures and 5xx responses
    /// are retried; any other response is returned to the caller.
    async fn send<F>(&self, operation: &str, build: F) -> PanelResult<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let build = &build;
        let redactor = &self.redactor;
        let attempts = self.policy.max_attempts.max(1);
        retry(
            &self.policy,
            operation,
            PanelError::is_transient,
            move |_attempt| async move {
                let response = build().send().await.map_err(|e| PanelError::Unreachable {
                    attempts,
                    reason: redactor.redact(&e.to_string()),
                })?;
                let status = response.status();
                if status.is_server_error() {
                    return Err(PanelError::Api {
                        status: status.as_u16(),
                        detail: error_detail(response).await,
                    });
                }
                Ok(response)
            },
        )
        .await
    }

    /// Authenticated call. A 401 drops the cached token and the call is
    /// repeated once with a fresh one.
    async fn call<F>(&self, operation: &str, build: F) -> PanelResult<Response>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let mut refreshed = false;
        loop {
            let token = self.authenticate().await?;
            let response = self
                .send(operation, || build(&self.http).bearer_auth(token.expose()))
                .await?;
            match response.status() {
                StatusCode::UNAUTHORIZED if !refreshed => {
                    debug!(%operation, "token rejected, re-authenticating");
                    self.invalidate_token();
                    refreshed = true;
                }
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    return Err(PanelError::Auth(error_detail(response).await));
                }
                _ => return Ok(response),
            }
        }
    }

    async fn find_node_id(&self, name: &str) -> PanelResult<Option<u64>> {
        Ok(self
            .list_nodes()
            .await?
            .into_iter()
            .find(|node| node.name == name)
            .map(|node| node.id))
    }
}

#[async_trait]
impl ControlPlane for PanelClient {
    async fn authenticate(&self) -> PanelResult<Secret> {
        if let Some(token) = self.cached_token() {
            return Ok(token);
        }

        let form = [
            ("username", self.credentials.username.as_str()),
            ("password", self.credentials.password.expose()),
        ];
        let url = self.url("/admin/token");
        let response = self
            .send("panel authenticate", || self.http.post(&url).form(&form))
            .await?;

        let status = response.status();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
            || status == StatusCode::UNPROCESSABLE_ENTITY
        {
            return Err(PanelError::Auth(
                self.redactor.redact(&error_detail(response).await),
            ));
        }
        let body: TokenResponse = decode(response).await?;
        let token = Secret::new(body.access_token);
        self.store_token(Some(token.clone()));
        info!(username = %self.credentials.username, "authenticated with panel");
        Ok(token)
    }

    fn invalidate_token(&self) {
        self.store_token(None);
    }

    async fn add_node(&self, node: &NewNode) -> PanelResult<u64> {
        let url = self.url("/node");
        let response = self
            .call("panel add node", |http| http.post(&url).json(node))
            .await?;

        let status = response.status();
        if status.is_success() {
            let created: PanelNode = decode(response).await?;
            info!(name = %node.name, id = created.id, "node registered with panel");
            return Ok(created.id);
        }

        let detail = error_detail(response).await;
        if already_exists(status, &detail) {
            info!(name = %node.name, "panel already knows node, resolving its id");
            return self.find_node_id(&node.name).await?.ok_or(PanelError::Api {
                status: status.as_u16(),
                detail: format!("{detail} (but {} is not listed)", node.name),
            });
        }
        Err(PanelError::Api {
            status: status.as_u16(),
            detail,
        })
    }

    async fn get_node(&self, id: u64) -> PanelResult<PanelNode> {
        let url = self.url(&format!("/node/{id}"));
        let response = self.call("panel get node", |http| http.get(&url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(PanelError::NotFound(id));
        }
        decode(response).await
    }

    async fn list_nodes(&self) -> PanelResult<Vec<PanelNode>> {
        let url = self.url("/nodes");
        let response = self.call("panel list nodes", |http| http.get(&url)).await?;
        decode(response).await
    }

    async fn delete_node(&self, id: u64) -> PanelResult<()> {
        let url = self.url(&format!("/node/{id}"));
        let response = self
            .call("panel delete node", |http| http.delete(&url))
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(PanelError::NotFound(id));
        }
        if !status.is_success() {
            return Err(PanelError::Api {
                status: status.as_u16(),
                detail: error_detail(response).await,
            });
        }
        info!(id, "node deleted from panel");
        Ok(())
    }
}

/// The panel's idempotency signal for `POST /node`.
fn already_exists(status: StatusCode, detail: &str) -> bool {
    status == StatusCode::CONFLICT
        || (status == StatusCode::BAD_REQUEST
            && detail.to_ascii_lowercase().contains("already exists"))
}

async fn decode<T: DeserializeOwned>(response: Response) -> PanelResult<T> {
    let status = response.status();
    if !status.is_success() {
        return Err(PanelError::Api {
            status: status.as_u16(),
            detail: error_detail(response).await,
        });
    }
    response.json().await.map_err(|e| PanelError::Decode {
        status: status.as_u16(),
        reason: e.to_string(),
    })
}

/// `detail` of a FastAPI-style error body, or the raw text.
async fn error_detail(response: Response) -> String {
    let text = response.text().await.unwrap_or_default();
    match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(serde_json::Value::Object(body)) => match body.get("detail") {
            Some(serde_json::Value::String(detail)) => detail.clone(),
            Some(other) => other.to_string(),
            None => text,
        },
        _ => text,
    }
}
