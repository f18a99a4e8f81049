use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Text sent to the bot in place of recognized DTMF tones.
pub const DTMF_MARKER: &str = "/DTMFKey #";

/// One active telephone call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSession {
    /// Correlation key allocated when the call is answered.
    pub session_id: String,
    /// Raw identifier of the remote party (e.g. `4:+14255550123`).
    pub caller_id: String,
    /// Call connection id media commands are issued against.
    pub call_connection_id: String,
    pub created_at: DateTime<Utc>,
}

impl CallSession {
    pub fn new(
        session_id: impl Into<String>,
        caller_id: impl Into<String>,
        call_connection_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            caller_id: caller_id.into(),
            call_connection_id: call_connection_id.into(),
            created_at: Utc::now(),
        }
    }
}

/// Whether a media operation is in flight on a call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaStatus {
    /// No media operation has been armed yet.
    #[default]
    Uninitialized,
    /// Listening or idle; a play may be issued.
    Available,
    /// A play is outstanding.
    Playing,
}

/// Outcome of the dispatch decision for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchAction {
    /// A media operation is in flight (or none was ever armed); do nothing.
    Hold,
    /// Play this message. Status has already moved to `Playing`.
    Play {
        session: CallSession,
        message: String,
    },
    /// Queue is drained; re-arm speech/DTMF recognition.
    Listen { session: CallSession },
}

/// Result of a completed recognition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recognition {
    Speech(String),
    Dtmf(String),
}

/// Bot Framework channel account (`from` / `recipient`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelAccount {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Bot Framework activity, trimmed to the fields the bridge reads or writes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    #[serde(rename = "type")]
    pub activity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<ChannelAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speak: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_format: Option<String>,
}

impl Activity {
    /// A plain user message authored by `from_id`.
    pub fn message(from_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            activity_type: "message".into(),
            from: Some(ChannelAccount {
                id: from_id.into(),
                name: None,
            }),
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// The marker message standing in for DTMF input.
    pub fn dtmf_marker(from_id: impl Into<String>) -> Self {
        Self {
            text_format: Some("plain".into()),
            ..Self::message(from_id, DTMF_MARKER)
        }
    }

    pub fn is_message(&self) -> bool {
        self.activity_type == "message"
    }

    pub fn from_id(&self) -> Option<&str> {
        self.from.as_ref().map(|f| f.id.as_str())
    }

    /// What should be spoken to the caller: `speak`, falling back to `text`.
    pub fn spoken_text(&self) -> Option<&str> {
        self.speak
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| self.text.as_deref().filter(|t| !t.trim().is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_wire_format() {
        let activity = Activity::dtmf_marker("session-1");
        let json = serde_json::to_value(&activity).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["from"]["id"], "session-1");
        assert_eq!(json["text"], "/DTMFKey #");
        assert_eq!(json["textFormat"], "plain");
        assert!(json.get("speak").is_none());
    }

    #[test]
    fn test_activity_parse_ignores_unknown_fields() {
        let activity: Activity = serde_json::from_value(serde_json::json!({
            "type": "message",
            "id": "abc|0001",
            "from": { "id": "bot-1", "name": "Copilot" },
            "text": "Hi there",
            "speak": "Hi there, caller",
            "channelData": { "x": 1 },
            "conversation": { "id": "conv-1" }
        }))
        .unwrap();
        assert!(activity.is_message());
        assert_eq!(activity.from_id(), Some("bot-1"));
        assert_eq!(activity.spoken_text(), Some("Hi there, caller"));
    }

    #[test]
    fn test_spoken_text_falls_back_to_text() {
        let mut activity = Activity::message("bot", "written");
        assert_eq!(activity.spoken_text(), Some("written"));
        activity.speak = Some("  ".into());
        assert_eq!(activity.spoken_text(), Some("written"));
        activity.text = None;
        assert_eq!(activity.spoken_text(), None);
    }

    #[test]
    fn test_media_status_default_is_uninitialized() {
        assert_eq!(MediaStatus::default(), MediaStatus::Uninitialized);
    }
}
