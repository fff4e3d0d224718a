//! HTTP adapter for the external reasoning service.
//!
//! Two endpoints, both JSON over POST:
//!
//! - `{endpoint}/plan` with `{factory_id, feature_request_id, feature_description}`
//! - `{endpoint}/synthesize` with `{feature_description, plan, iteration, diagnostics}`
//!
//! Both answer `{ "plan"?: ..., "code_diff"?: {...}, "replan"?: "reason" }`.
//! Connection errors, timeouts, 429 and 5xx responses are retried here with
//! exponential backoff; the repair loop only sees the final outcome.

use std::time::Duration;

use anvil_common::{
    CodeDiff, CollaboratorError, Diagnostic, FeatureRequest, ImplementationPlan, Planner,
    SynthesisOutput, SynthesisRequest, Synthesizer,
};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::config::ReasoningSection;

#[derive(Debug, Serialize)]
struct PlanBody<'a> {
    factory_id: i64,
    feature_request_id: String,
    feature_description: &'a str,
}

#[derive(Debug, Serialize)]
struct SynthesizeBody<'a> {
    feature_description: &'a str,
    plan: &'a ImplementationPlan,
    iteration: u32,
    diagnostics: &'a [Diagnostic],
}

/// Response shape shared by both endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct ReasoningResponse {
    /// Either a plan object or text containing one.
    #[serde(default)]
    pub plan: Option<serde_json::Value>,
    #[serde(default)]
    pub code_diff: Option<CodeDiff>,
    #[serde(default)]
    pub replan: Option<String>,
}

impl ReasoningResponse {
    pub fn into_plan(self) -> Result<ImplementationPlan, CollaboratorError> {
        let value = self
            .plan
            .ok_or_else(|| CollaboratorError::Malformed("response has no plan".to_string()))?;
        let plan = match value {
            serde_json::Value::String(text) => ImplementationPlan::parse(&text),
            other => serde_json::from_value::<ImplementationPlan>(other)
                .map_err(|e| format!("plan does not match schema: {}", e))
                .and_then(|p| p.check().map(|_| p)),
        };
        plan.map_err(CollaboratorError::Malformed)
    }

    pub fn into_synthesis(self) -> Result<SynthesisOutput, CollaboratorError> {
        if let Some(reason) = self.replan {
            return Ok(SynthesisOutput::Replan { reason });
        }
        match self.code_diff {
            Some(diff) if !diff.is_empty() => Ok(SynthesisOutput::Diff(diff)),
            Some(_) => Err(CollaboratorError::Malformed(
                "code_diff contains no edits".to_string(),
            )),
            None => Err(CollaboratorError::Malformed(
                "response has neither code_diff nor replan".to_string(),
            )),
        }
    }
}

/// `Planner` and `Synthesizer` backed by the reasoning service.
#[derive(Clone)]
pub struct HttpReasoningClient {
    client: reqwest::Client,
    endpoint: String,
    transient_retries: u32,
    backoff: Duration,
}

impl HttpReasoningClient {
    pub fn new(config: &ReasoningSection) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build reasoning HTTP client: {}", e))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            transient_retries: config.transient_retries,
            backoff: Duration::from_millis(config.backoff_ms),
        })
    }

    /// POST `body` to `path`, retrying transient failures.
    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<ReasoningResponse, CollaboratorError> {
        let url = format!("{}/{}", self.endpoint, path);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.post_once(&url, body).await {
                Err(e) if e.is_transient() && attempt <= self.transient_retries => {
                    let delay = self.backoff * 2u32.saturating_pow(attempt - 1);
                    tracing::warn!(
                        url = %url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient reasoning failure, will retry"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    async fn post_once<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<ReasoningResponse, CollaboratorError> {
        let resp = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| CollaboratorError::Transient(format!("request to {} failed: {}", url, e)))?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(CollaboratorError::Transient(format!(
                "{} returned {}",
                url, status
            )));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(CollaboratorError::Rejected(format!(
                "{} returned {}: {}",
                url,
                status,
                text.trim()
            )));
        }

        let text = resp
            .text()
            .await
            .map_err(|e| CollaboratorError::Transient(format!("failed to read body: {}", e)))?;
        serde_json::from_str(&text)
            .map_err(|e| CollaboratorError::Malformed(format!("response is not valid JSON: {}", e)))
    }
}

#[async_trait]
impl Planner for HttpReasoningClient {
    async fn plan(&self, request: &FeatureRequest) -> Result<ImplementationPlan, CollaboratorError> {
        let body = PlanBody {
            factory_id: request.factory_id,
            feature_request_id: request.id.to_string(),
            feature_description: &request.description,
        };
        self.post("plan", &body).await?.into_plan()
    }
}

#[async_trait]
impl Synthesizer for HttpReasoningClient {
    async fn synthesize(
        &self,
        request: SynthesisRequest<'_>,
    ) -> Result<SynthesisOutput, CollaboratorError> {
        let body = SynthesizeBody {
            feature_description: &request.feature.description,
            plan: request.plan,
            iteration: request.iteration,
            diagnostics: request.diagnostics,
        };
        self.post("synthesize", &body).await?.into_synthesis()
    }
}
