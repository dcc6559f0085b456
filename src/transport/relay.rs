use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::error::{Error, Result};
use crate::protocol::models::{Content, DEFAULT_VOICE};

pub const CHAT_MODEL: &str = "gemini-3-flash-preview";
pub const ANALYSIS_MODEL: &str = "gemini-3-pro-preview";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Short-lived key for the live endpoint. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RelayAction {
    Chat,
    Analyze,
    Transcribe,
    Tts,
    Plan,
}

#[derive(Debug, Serialize)]
struct RelayRequest<'a, P: Serialize> {
    action: RelayAction,
    payload: &'a P,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RelayResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CredentialResponse {
    #[serde(default)]
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RelayErrorBody {
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub message: String,
    pub history: Vec<Content>,
    pub system_instruction: String,
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzePayload {
    pub base64: String,
    pub mime_type: String,
    pub prompt: String,
    pub system_instruction: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscribePayload {
    pub base64: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TtsPayload {
    pub text: String,
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanPayload {
    pub prompt: String,
}

/// Inputs of the study-plan generator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StudyPlanRequest {
    pub goal: String,
    pub stage: String,
    pub area: String,
    pub days_per_week: String,
    pub hours_per_day: String,
    pub limitations: String,
    pub difficulties: Option<String>,
}

impl StudyPlanRequest {
    #[must_use]
    pub fn to_prompt(&self) -> String {
        let difficulties = self.difficulties.as_deref().unwrap_or("none stated");
        format!(
            "Act as a legal studies coach (Prof. Clodoaldo).\n\
             Goal: {}. Stage: {}. Area: {}.\n\
             Availability: {} days, {}h/day.\n\
             Difficulties: {difficulties}. Limitations: {}.\n\n\
             Produce COMPLETE HTML using H2, UL, LI, P and TABLE tags.\n\
             Lay out a detailed, motivating and technical study or career plan.",
            self.goal, self.stage, self.area, self.days_per_week, self.hours_per_day, self.limitations,
        )
    }
}

/// Client for the trusted relay that holds the provider secret.
#[derive(Clone, Debug)]
pub struct RelayClient {
    client: Client,
    base: Url,
}

impl RelayClient {
    /// # Errors
    /// Returns an error if the URL is invalid or the HTTP client cannot be built.
    #[allow(clippy::result_large_err)]
    pub fn new(base_url: &str) -> Result<Self> {
        Self::new_with_timeouts(base_url, DEFAULT_TIMEOUT, DEFAULT_POOL_IDLE_TIMEOUT)
    }

    /// # Errors
    /// Returns an error if the URL is invalid or the HTTP client cannot be built.
    #[allow(clippy::result_large_err)]
    pub fn new_with_timeouts(
        base_url: &str,
        timeout: Duration,
        pool_idle_timeout: Duration,
    ) -> Result<Self> {
        let base = Url::parse(base_url)?;
        let client = Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(pool_idle_timeout)
            .build()?;
        Ok(Self { client, base })
    }

    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base
    }

    /// Ask the relay for a fresh live-endpoint credential.
    ///
    /// # Errors
    /// Returns `AuthFailure` on a non-success status or a missing key, or a
    /// transport error if the relay cannot be reached.
    pub async fn fetch_credential(&self) -> Result<Credential> {
        let mut url = self.base.clone();
        url.query_pairs_mut().append_pair("action", "key");

        let res = self.client.get(url).send().await?;
        let status = res.status();
        if !status.is_success() {
            tracing::warn!(%status, "Relay refused to issue a voice credential");
            return Err(Error::AuthFailure(format!("relay returned {status}")));
        }

        let body: CredentialResponse = res
            .json()
            .await
            .map_err(|e| Error::AuthFailure(format!("unreadable credential response: {e}")))?;
        match body.key {
            Some(key) if !key.is_empty() => Ok(Credential::new(key)),
            _ => Err(Error::AuthFailure("relay returned no credential".to_string())),
        }
    }

    /// Invoke one relay action.
    ///
    /// # Errors
    /// Returns `Error::Relay` with the relay's message on a non-success status,
    /// or a transport/serialization error.
    pub async fn call<P: Serialize + Sync>(
        &self,
        action: RelayAction,
        payload: &P,
        model: Option<&str>,
    ) -> Result<RelayResponse> {
        let res = self.client
            .post(self.base.clone())
            .json(&RelayRequest { action, payload, model })
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            let message = res
                .json::<RelayErrorBody>()
                .await
                .ok()
                .and_then(|body| body.error)
                .unwrap_or_else(|| format!("server error: {}", status.as_u16()));
            tracing::error!(?action, %status, %message, "Relay action failed");
            return Err(Error::Relay { status: status.as_u16(), message });
        }

        Ok(res.json().await?)
    }

    /// # Errors
    /// Returns an error if the relay call fails or returns no text.
    pub async fn chat(&self, payload: &ChatPayload) -> Result<String> {
        let res = self.call(RelayAction::Chat, payload, Some(CHAT_MODEL)).await?;
        expect_text(res)
    }

    /// # Errors
    /// Returns an error if the relay call fails or returns no text.
    pub async fn analyze(&self, payload: &AnalyzePayload) -> Result<String> {
        let res = self.call(RelayAction::Analyze, payload, Some(ANALYSIS_MODEL)).await?;
        expect_text(res)
    }

    /// # Errors
    /// Returns an error if the relay call fails or returns no text.
    pub async fn transcribe(&self, base64: impl Into<String>, mime_type: impl Into<String>) -> Result<String> {
        let payload = TranscribePayload { base64: base64.into(), mime_type: mime_type.into() };
        let res = self.call(RelayAction::Transcribe, &payload, None).await?;
        expect_text(res)
    }

    /// Synthesize speech. `Ok(None)` when the provider produced no audio.
    ///
    /// # Errors
    /// Returns an error if the relay call fails.
    pub async fn tts(&self, text: impl Into<String>, voice_name: Option<&str>) -> Result<Option<String>> {
        let payload = TtsPayload {
            text: text.into(),
            voice_name: voice_name.unwrap_or(DEFAULT_VOICE).to_string(),
        };
        Ok(self.call(RelayAction::Tts, &payload, None).await?.audio_data)
    }

    /// # Errors
    /// Returns an error if the relay call fails or returns no text.
    pub async fn plan(&self, request: &StudyPlanRequest) -> Result<String> {
        let payload = PlanPayload { prompt: request.to_prompt() };
        let res = self.call(RelayAction::Plan, &payload, Some(ANALYSIS_MODEL)).await?;
        expect_text(res)
    }
}

#[allow(clippy::result_large_err)]
fn expect_text(res: RelayResponse) -> Result<String> {
    res.text.ok_or_else(|| Error::Relay {
        status: StatusCode::OK.as_u16(),
        message: "response carried no text".to_string(),
    })
}
