use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::session::IdentityProvider;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleActionResponse {
    pub ok: bool,
    pub payload: Value,
}

/// Invokes server-side module actions over HTTP.
pub struct ModuleAction {
    client: reqwest::Client,
    functions_url: String,
    identity: Option<Arc<dyn IdentityProvider>>,
}

impl ModuleAction {
    pub fn new(functions_url: impl Into<String>, identity: Option<Arc<dyn IdentityProvider>>) -> Self {
        Self {
            client: reqwest::Client::new(),
            functions_url: functions_url.into().trim_end_matches('/').to_string(),
            identity,
        }
    }

    pub fn functions_url(&self) -> &str {
        &self.functions_url
    }

    /// POSTs `payload` to `{functions_url}/{function}/{module}/{action}`.
    ///
    /// A string payload is sent as-is, anything else as JSON. A failed call
    /// whose body carries no `error` gets one describing the HTTP status.
    pub async fn invoke(
        &self,
        function: &str,
        module: &str,
        action: &str,
        payload: Option<Value>,
    ) -> Result<ModuleActionResponse> {
        let url = format!("{}/{}/{}/{}", self.functions_url, function, module, action);
        let mut request = self
            .client
            .post(&url)
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json");

        if let Some(identity) = &self.identity {
            if identity.current_user().await.is_some() {
                let token = identity.id_token(false).await?;
                request = request.header(AUTHORIZATION, format!("Bearer {token}"));
            }
        }

        match payload {
            Some(Value::String(raw)) => request = request.body(raw),
            Some(value) => request = request.body(serde_json::to_string(&value)?),
            None => {}
        }

        debug!(%url, "invoking module action");
        let response = request.send().await?;
        let status = response.status();
        let mut payload: Value = response
            .json()
            .await
            .with_context(|| format!("{url} did not answer with json"))?;

        if !status.is_success() {
            warn!(%url, status = status.as_u16(), "module action failed");
            if let Value::Object(body) = &mut payload {
                if body.get("error").map_or(true, Value::is_null) {
                    body.insert(
                        "error".to_string(),
                        json!({"message": "Unsuccessful", "status": status.as_u16()}),
                    );
                }
            }
        }

        Ok(ModuleActionResponse {
            ok: status.is_success(),
            payload,
        })
    }
}
