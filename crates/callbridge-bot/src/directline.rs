//! Direct Line 3.0 connector (Copilot Studio / Bot Framework bots).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::{RwLock, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use callbridge_core::config::BotConfig;
use callbridge_core::error::{BridgeError, Result};
use callbridge_core::types::Activity;

use crate::{ActivityReceiver, ActivitySender, BotConnector};

/// Tokens closer than this to expiry are refreshed before reconnecting.
const REFRESH_MARGIN: Duration = Duration::from_secs(120);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Token handed out by the bot's token endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub token: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default, rename = "conversationId")]
    pub conversation_id: Option<String>,
}

/// Response of starting or reconnecting to a conversation.
#[derive(Debug, Clone, Deserialize)]
pub struct ConversationResponse {
    #[serde(rename = "conversationId")]
    pub conversation_id: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default, rename = "streamUrl")]
    pub stream_url: Option<String>,
}

/// One frame of the activity stream.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActivitySet {
    #[serde(default)]
    pub activities: Vec<Activity>,
    #[serde(default)]
    pub watermark: Option<String>,
}

/// Parse a stream frame. Empty frames are keep-alives.
pub fn parse_activity_set(frame: &str) -> Result<Option<ActivitySet>> {
    if frame.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(frame)?))
}

struct Credentials {
    token: String,
    expires_at: Option<Instant>,
}

impl Credentials {
    fn new(token: String, expires_in: Option<u64>) -> Self {
        Self {
            token,
            expires_at: expires_in.map(|s| Instant::now() + Duration::from_secs(s)),
        }
    }

    fn needs_refresh(&self) -> bool {
        self.expires_at
            .is_some_and(|at| at.saturating_duration_since(Instant::now()) < REFRESH_MARGIN)
    }
}

/// Live state of one call's conversation.
struct Conversation {
    conversation_id: String,
    credentials: RwLock<Credentials>,
    watermark: RwLock<Option<String>>,
    stream_cancel: Mutex<CancellationToken>,
}

impl Conversation {
    async fn token(&self) -> String {
        self.credentials.read().await.token.clone()
    }

    /// Cancel the running stream task and arm a fresh token for the next one.
    fn restart_stream(&self) -> CancellationToken {
        let mut guard = self
            .stream_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        guard.cancel();
        *guard = CancellationToken::new();
        guard.clone()
    }

    fn stop_stream(&self) {
        self.stream_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }
}

/// Thin REST client shared by the connector and its stream tasks.
#[derive(Clone)]
struct DirectLineApi {
    client: reqwest::Client,
    base_url: String,
    token_endpoint: String,
}

impl DirectLineApi {
    async fn fetch_token(&self) -> Result<TokenResponse> {
        let resp = self
            .client
            .get(&self.token_endpoint)
            .send()
            .await
            .map_err(|e| BridgeError::StreamUnavailable(format!("token request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(BridgeError::StreamUnavailable(format!(
                "token endpoint returned {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| BridgeError::StreamUnavailable(format!("bad token response: {e}")))
    }

    async fn start_conversation(&self, token: &str) -> Result<ConversationResponse> {
        let resp = self
            .client
            .post(format!("{}/conversations", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| BridgeError::StreamUnavailable(format!("start conversation: {e}")))?;
        if !resp.status().is_success() {
            return Err(BridgeError::StreamUnavailable(format!(
                "start conversation returned {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| BridgeError::StreamUnavailable(format!("bad conversation response: {e}")))
    }

    async fn refresh_token(&self, token: &str) -> Result<TokenResponse> {
        let resp = self
            .client
            .post(format!("{}/tokens/refresh", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| BridgeError::StreamUnavailable(format!("token refresh: {e}")))?;
        if !resp.status().is_success() {
            return Err(BridgeError::StreamUnavailable(format!(
                "token refresh returned {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| BridgeError::StreamUnavailable(format!("bad refresh response: {e}")))
    }

    /// Get a fresh stream URL for an existing conversation, resuming at
    /// the last watermark.
    async fn reconnect(&self, conversation: &Conversation) -> Result<String> {
        self.ensure_fresh_token(conversation).await?;

        let mut url = format!(
            "{}/conversations/{}",
            self.base_url,
            urlencoding::encode(&conversation.conversation_id)
        );
        if let Some(watermark) = conversation.watermark.read().await.as_deref() {
            url.push_str(&format!("?watermark={}", urlencoding::encode(watermark)));
        }

        let resp = self
            .client
            .get(&url)
            .bearer_auth(conversation.token().await)
            .send()
            .await
            .map_err(|e| BridgeError::StreamUnavailable(format!("reconnect: {e}")))?;
        if !resp.status().is_success() {
            return Err(BridgeError::StreamUnavailable(format!(
                "reconnect returned {}",
                resp.status()
            )));
        }
        let body: ConversationResponse = resp
            .json()
            .await
            .map_err(|e| BridgeError::StreamUnavailable(format!("bad reconnect response: {e}")))?;
        body.stream_url
            .ok_or_else(|| BridgeError::StreamUnavailable("reconnect returned no streamUrl".into()))
    }

    /// Refresh the conversation token when it is inside the refresh margin.
    /// Concurrent callers wait on the write lock and refresh only once.
    async fn ensure_fresh_token(&self, conversation: &Conversation) -> Result<()> {
        if !conversation.credentials.read().await.needs_refresh() {
            return Ok(());
        }
        let mut credentials = conversation.credentials.write().await;
        if !credentials.needs_refresh() {
            return Ok(());
        }
        let refreshed = self.refresh_token(&credentials.token).await?;
        *credentials = Credentials::new(refreshed.token, refreshed.expires_in);
        debug!(conversation = %conversation.conversation_id, "Direct Line token refreshed");
        Ok(())
    }

    async fn post_activity(&self, conversation: &Conversation, activity: &Activity) -> Result<()> {
        if let Err(e) = self.ensure_fresh_token(conversation).await {
            // The current token may still be inside its lifetime
            warn!(conversation = %conversation.conversation_id, %e, "Token refresh failed before post");
        }
        let url = format!(
            "{}/conversations/{}/activities",
            self.base_url,
            urlencoding::encode(&conversation.conversation_id)
        );
        let resp = self
            .client
            .post(&url)
            .bearer_auth(conversation.token().await)
            .json(activity)
            .send()
            .await
            .map_err(|e| BridgeError::RemoteCommand(format!("post activity: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(BridgeError::RemoteCommand(format!(
                "post activity returned {status}: {text}"
            )));
        }
        Ok(())
    }
}

enum StreamEnd {
    /// The server closed the socket; reconnect.
    Closed,
    /// Nobody is listening anymore; stop for good.
    ReceiverGone,
}

/// Read one WebSocket connection until it closes.
async fn read_stream(
    url: &str,
    conversation: &Conversation,
    tx: &ActivitySender,
) -> Result<StreamEnd> {
    let (mut ws, _) = connect_async(url)
        .await
        .map_err(|e| BridgeError::StreamUnavailable(format!("stream connect: {e}")))?;
    debug!(conversation = %conversation.conversation_id, "Activity stream connected");

    while let Some(frame) = ws.next().await {
        let frame = frame.map_err(|e| BridgeError::StreamUnavailable(e.to_string()))?;
        match frame {
            Message::Text(text) => {
                let Some(set) = parse_activity_set(text.as_str())? else {
                    continue;
                };
                if let Some(watermark) = set.watermark {
                    *conversation.watermark.write().await = Some(watermark);
                }
                for activity in set.activities {
                    if tx.send(activity).await.is_err() {
                        return Ok(StreamEnd::ReceiverGone);
                    }
                }
            }
            Message::Close(_) => return Ok(StreamEnd::Closed),
            _ => {}
        }
    }
    Ok(StreamEnd::Closed)
}

/// Sleep unless cancelled first. Returns `false` when cancelled.
async fn pause(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Keep one conversation's stream alive until cancelled or abandoned.
async fn run_stream(
    api: DirectLineApi,
    conversation: Arc<Conversation>,
    mut url: String,
    tx: ActivitySender,
    cancel: CancellationToken,
) {
    let id = conversation.conversation_id.clone();
    let mut backoff = Duration::from_secs(1);

    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = read_stream(&url, &conversation, &tx) => outcome,
        };

        match outcome {
            Ok(StreamEnd::ReceiverGone) => break,
            Ok(StreamEnd::Closed) => {
                debug!(conversation = %id, "Activity stream closed, reconnecting");
                backoff = Duration::from_secs(1);
            }
            Err(e) => {
                warn!(conversation = %id, %e, "Activity stream error");
                if !pause(&cancel, backoff).await {
                    break;
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }

        loop {
            let reconnected = tokio::select! {
                _ = cancel.cancelled() => return,
                r = api.reconnect(&conversation) => r,
            };
            match reconnected {
                Ok(next) => {
                    url = next;
                    break;
                }
                Err(e) => {
                    warn!(conversation = %id, %e, "Reconnect failed");
                    if !pause(&cancel, backoff).await {
                        return;
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    debug!(conversation = %id, "Activity stream stopped");
}

/// Direct Line connector keyed by call session id.
pub struct DirectLineConnector {
    api: DirectLineApi,
    channel_capacity: usize,
    conversations: RwLock<HashMap<String, Arc<Conversation>>>,
}

impl DirectLineConnector {
    pub fn new(token_endpoint: String, base_url: String, channel_capacity: usize) -> Self {
        Self {
            api: DirectLineApi {
                client: reqwest::Client::new(),
                base_url: base_url.trim_end_matches('/').to_string(),
                token_endpoint,
            },
            channel_capacity: channel_capacity.max(1),
            conversations: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &BotConfig) -> Result<Self> {
        let token_endpoint = config
            .resolve_token_endpoint()
            .ok_or_else(|| BridgeError::Config("bot token endpoint is not configured".into()))?;
        Ok(Self::new(
            token_endpoint,
            config.directline_url.clone(),
            config.channel_capacity,
        ))
    }

    pub async fn conversation_id(&self, session_id: &str) -> Option<String> {
        self.conversations
            .read()
            .await
            .get(session_id)
            .map(|c| c.conversation_id.clone())
    }

    async fn create(&self, session_id: &str) -> Result<(Arc<Conversation>, String)> {
        let token = self.api.fetch_token().await?;
        let started = self.api.start_conversation(&token.token).await?;
        let stream_url = started.stream_url.clone().ok_or_else(|| {
            BridgeError::StreamUnavailable("start conversation returned no streamUrl".into())
        })?;

        let credentials = match started.token {
            Some(t) => Credentials::new(t, started.expires_in.or(token.expires_in)),
            None => Credentials::new(token.token, token.expires_in),
        };
        let conversation = Arc::new(Conversation {
            conversation_id: started.conversation_id,
            credentials: RwLock::new(credentials),
            watermark: RwLock::new(None),
            stream_cancel: Mutex::new(CancellationToken::new()),
        });

        info!(
            session_id,
            conversation = %conversation.conversation_id,
            "Bot conversation started"
        );
        Ok((conversation, stream_url))
    }

    fn spawn_stream(&self, conversation: Arc<Conversation>, url: String) -> ActivityReceiver {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let cancel = conversation.restart_stream();
        tokio::spawn(run_stream(self.api.clone(), conversation, url, tx, cancel));
        rx
    }
}

#[async_trait]
impl BotConnector for DirectLineConnector {
    fn id(&self) -> &str {
        "directline"
    }

    async fn open(&self, session_id: &str) -> Result<ActivityReceiver> {
        let existing = self.conversations.read().await.get(session_id).cloned();

        if let Some(conversation) = existing {
            let url = self.api.reconnect(&conversation).await?;
            info!(session_id, conversation = %conversation.conversation_id, "Bot conversation resumed");
            return Ok(self.spawn_stream(conversation, url));
        }

        let (conversation, url) = self.create(session_id).await?;
        let winner = {
            let mut conversations = self.conversations.write().await;
            match conversations.get(session_id) {
                Some(existing) => Some(existing.clone()),
                None => {
                    conversations.insert(session_id.to_string(), conversation.clone());
                    None
                }
            }
        };

        match winner {
            None => Ok(self.spawn_stream(conversation, url)),
            Some(existing) => {
                // A concurrent open registered first; abandon ours and join it.
                conversation.stop_stream();
                debug!(
                    session_id,
                    abandoned = %conversation.conversation_id,
                    conversation = %existing.conversation_id,
                    "Concurrent open, resuming registered conversation"
                );
                let url = self.api.reconnect(&existing).await?;
                Ok(self.spawn_stream(existing, url))
            }
        }
    }

    async fn post(&self, session_id: &str, activity: Activity) -> Result<()> {
        let conversation = self
            .conversations
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| {
                BridgeError::StreamUnavailable(format!("no conversation for {session_id}"))
            })?;
        self.api.post_activity(&conversation, &activity).await
    }

    async fn close(&self, session_id: &str) {
        if let Some(conversation) = self.conversations.write().await.remove(session_id) {
            conversation.stop_stream();
            debug!(session_id, conversation = %conversation.conversation_id, "Bot conversation closed");
        }
    }
}
