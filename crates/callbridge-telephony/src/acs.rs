//! Azure Communication Services Call Automation client.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Url;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, error};

use callbridge_core::config::{RecognizeConfig, TelephonyConfig};
use callbridge_core::error::{BridgeError, Result};

use crate::{AnsweredCall, CallControl};

type HmacSha256 = Hmac<Sha256>;

/// Endpoint and decoded access key from an ACS connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub endpoint: String,
    pub access_key: Vec<u8>,
}

/// Parse `endpoint=https://...;accesskey=<base64>`. Keys are case-insensitive.
pub fn parse_connection_string(raw: &str) -> Result<ConnectionString> {
    let mut endpoint = None;
    let mut access_key = None;

    for part in raw.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        match key.to_ascii_lowercase().as_str() {
            "endpoint" => endpoint = Some(value.trim_end_matches('/').to_string()),
            "accesskey" => {
                let decoded = STANDARD
                    .decode(value)
                    .map_err(|e| BridgeError::Config(format!("accesskey is not base64: {e}")))?;
                access_key = Some(decoded);
            }
            _ => {}
        }
    }

    match (endpoint, access_key) {
        (Some(endpoint), Some(access_key)) => Ok(ConnectionString {
            endpoint,
            access_key,
        }),
        _ => Err(BridgeError::Config(
            "connection string must contain endpoint= and accesskey=".into(),
        )),
    }
}

/// Build a communication identifier model from a raw id such as
/// `4:+14255550123` or `8:acs:<resource>_<user>`.
pub fn identifier_from_raw_id(raw_id: &str) -> serde_json::Value {
    if let Some(number) = raw_id.strip_prefix("4:") {
        return json!({
            "rawId": raw_id,
            "kind": "phoneNumber",
            "phoneNumber": { "value": number },
        });
    }

    let is_acs_user = ["8:acs:", "8:spool:", "8:dod-acs:", "8:gcch-acs:"]
        .iter()
        .any(|prefix| raw_id.starts_with(prefix));
    if is_acs_user {
        return json!({
            "rawId": raw_id,
            "kind": "communicationUser",
            "communicationUser": { "id": raw_id },
        });
    }

    json!({ "rawId": raw_id, "kind": "unknown" })
}

/// Headers produced by HMAC request signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub date: String,
    pub content_hash: String,
    pub authorization: String,
}

/// Sign a request the way the ACS REST API expects.
pub fn sign_request(
    method: &str,
    url: &Url,
    body: &[u8],
    access_key: &[u8],
    now: DateTime<Utc>,
) -> Result<SignedHeaders> {
    let date = now.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    let content_hash = STANDARD.encode(Sha256::digest(body));

    let host = match (url.host_str(), url.port()) {
        (Some(h), Some(p)) => format!("{h}:{p}"),
        (Some(h), None) => h.to_string(),
        (None, _) => return Err(BridgeError::Config(format!("URL has no host: {url}"))),
    };
    let path_and_query = match url.query() {
        Some(q) => format!("{}?{q}", url.path()),
        None => url.path().to_string(),
    };

    let string_to_sign = format!("{method}\n{path_and_query}\n{date};{host};{content_hash}");
    let mut mac = HmacSha256::new_from_slice(access_key)
        .map_err(|e| BridgeError::Config(format!("invalid access key: {e}")))?;
    mac.update(string_to_sign.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    Ok(SignedHeaders {
        date,
        content_hash,
        authorization: format!(
            "HMAC-SHA256 SignedHeaders=x-ms-date;host;x-ms-content-sha256&Signature={signature}"
        ),
    })
}

fn text_source(text: &str, voice_name: &str) -> serde_json::Value {
    json!({
        "kind": "text",
        "text": { "text": text, "voiceName": voice_name },
    })
}

/// Body of `POST /calling/callConnections:answer`.
pub fn answer_body(
    incoming_call_context: &str,
    callback_uri: &str,
    cognitive_services_endpoint: Option<&str>,
) -> serde_json::Value {
    let mut body = json!({
        "incomingCallContext": incoming_call_context,
        "callbackUri": callback_uri,
    });
    if let Some(endpoint) = cognitive_services_endpoint {
        body["callIntelligenceOptions"] = json!({ "cognitiveServicesEndpoint": endpoint });
    }
    body
}

/// Body of `POST /calling/callConnections/{id}:play`.
pub fn play_body(text: &str, target: &str, voice_name: &str) -> serde_json::Value {
    json!({
        "playSources": [text_source(text, voice_name)],
        "playTo": [identifier_from_raw_id(target)],
        "playOptions": { "loop": false },
    })
}

/// Body of `POST /calling/callConnections/{id}:recognize` (speech or DTMF).
pub fn recognize_body(
    target: &str,
    prompt: Option<&str>,
    voice_name: &str,
    options: &RecognizeConfig,
) -> serde_json::Value {
    let mut body = json!({
        "recognizeInputType": "speechOrDtmf",
        "interruptCallMediaOperation": false,
        "recognizeOptions": {
            "interruptPrompt": options.interrupt_prompt,
            "initialSilenceTimeoutInSeconds": options.initial_silence_timeout_secs,
            "targetParticipant": identifier_from_raw_id(target),
            "speechOptions": {
                "endSilenceTimeoutInMs": u64::from(options.end_silence_timeout_secs) * 1000,
            },
            "dtmfOptions": {
                "maxTonesToCollect": options.max_tones_to_collect,
            },
        },
    });
    if let Some(prompt) = prompt.filter(|p| !p.is_empty()) {
        body["playPrompt"] = text_source(prompt, voice_name);
    }
    body
}

/// ACS Call Automation REST client.
pub struct AcsCallControl {
    client: reqwest::Client,
    endpoint: String,
    access_key: Vec<u8>,
    api_version: String,
    voice_name: String,
    cognitive_services_endpoint: Option<String>,
}

impl AcsCallControl {
    pub fn new(
        connection: ConnectionString,
        api_version: String,
        voice_name: String,
        cognitive_services_endpoint: Option<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: connection.endpoint,
            access_key: connection.access_key,
            api_version,
            voice_name,
            cognitive_services_endpoint,
        }
    }

    /// Build a client from the telephony config section.
    pub fn from_config(config: &TelephonyConfig) -> Result<Self> {
        let raw = config.resolve_connection_string().ok_or_else(|| {
            BridgeError::Config("telephony connection string is not configured".into())
        })?;
        Ok(Self::new(
            parse_connection_string(&raw)?,
            config.api_version.clone(),
            config.voice_name.clone(),
            config.cognitive_services_endpoint.clone(),
        ))
    }

    fn url(&self, path: &str) -> Result<Url> {
        let raw = format!("{}{path}?api-version={}", self.endpoint, self.api_version);
        Url::parse(&raw).map_err(|e| BridgeError::Config(format!("bad ACS URL {raw}: {e}")))
    }

    fn connection_path(call_connection_id: &str, action: &str) -> String {
        format!(
            "/calling/callConnections/{}:{action}",
            urlencoding::encode(call_connection_id)
        )
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<reqwest::Response> {
        let url = self.url(path)?;
        let payload = serde_json::to_vec(body)?;
        let signed = sign_request("POST", &url, &payload, &self.access_key, Utc::now())?;

        debug!(%path, "ACS request");
        let resp = self
            .client
            .post(url)
            .header("x-ms-date", &signed.date)
            .header("x-ms-content-sha256", &signed.content_hash)
            .header("Authorization", &signed.authorization)
            .header("Content-Type", "application/json")
            .body(payload)
            .send()
            .await
            .map_err(|e| BridgeError::RemoteCommand(format!("{path}: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            error!(%path, %status, "ACS request rejected");
            return Err(BridgeError::RemoteCommand(format!("{path}: {status} {text}")));
        }
        Ok(resp)
    }
}

#[async_trait]
impl CallControl for AcsCallControl {
    fn id(&self) -> &str {
        "acs"
    }

    async fn answer_call(
        &self,
        incoming_call_context: &str,
        callback_uri: &str,
    ) -> Result<AnsweredCall> {
        let body = answer_body(
            incoming_call_context,
            callback_uri,
            self.cognitive_services_endpoint.as_deref(),
        );
        let resp = self.post("/calling/callConnections:answer", &body).await?;
        let answered: AnsweredCall = resp
            .json()
            .await
            .map_err(|e| BridgeError::RemoteCommand(format!("answer response: {e}")))?;
        Ok(answered)
    }

    async fn play(&self, call_connection_id: &str, text: &str, target: &str) -> Result<()> {
        let body = play_body(text, target, &self.voice_name);
        self.post(&Self::connection_path(call_connection_id, "play"), &body)
            .await?;
        Ok(())
    }

    async fn listen(
        &self,
        call_connection_id: &str,
        target: &str,
        prompt: Option<&str>,
        options: &RecognizeConfig,
    ) -> Result<()> {
        let body = recognize_body(target, prompt, &self.voice_name, options);
        self.post(&Self::connection_path(call_connection_id, "recognize"), &body)
            .await?;
        Ok(())
    }
}
