//! Call-facing side of the bot conversation.

use std::sync::Arc;

use tracing::debug;

use callbridge_bot::{ActivityReceiver, BotConnector};
use callbridge_core::error::Result;
use callbridge_core::types::Activity;

/// Adapts bot activities into playable text and caller input into
/// activities. Holds no session state of its own; everything is keyed by
/// the session id.
#[derive(Clone)]
pub struct ConversationBridge {
    connector: Arc<dyn BotConnector>,
    bot_id: Option<String>,
}

impl ConversationBridge {
    pub fn new(connector: Arc<dyn BotConnector>, bot_id: Option<String>) -> Self {
        Self { connector, bot_id }
    }

    /// Text to play for an inbound activity, if it is a message authored
    /// by the bot. Without a configured bot id, any message not echoed
    /// back from the caller's own side is accepted.
    pub fn accept(&self, session_id: &str, activity: &Activity) -> Option<String> {
        if !activity.is_message() {
            return None;
        }
        let from = activity.from_id()?;
        let authored_by_bot = match &self.bot_id {
            Some(bot_id) => from == bot_id,
            None => from != session_id,
        };
        if !authored_by_bot {
            debug!(session_id, from, "Skipping activity not authored by the bot");
            return None;
        }
        activity.spoken_text().map(str::to_string)
    }

    pub async fn subscribe(&self, session_id: &str) -> Result<ActivityReceiver> {
        self.connector.open(session_id).await
    }

    pub async fn send_text(&self, session_id: &str, text: &str) -> Result<()> {
        self.connector
            .post(session_id, Activity::message(session_id, text))
            .await
    }

    pub async fn send_dtmf(&self, session_id: &str) -> Result<()> {
        self.connector
            .post(session_id, Activity::dtmf_marker(session_id))
            .await
    }

    pub async fn close(&self, session_id: &str) {
        self.connector.close(session_id).await;
    }
}
