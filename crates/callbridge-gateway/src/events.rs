//! Inbound call-control events.
//!
//! Two payload shapes arrive over HTTP: Event Grid events on `/webhook`
//! (subscription validation and incoming calls) and Call Automation
//! callbacks in CloudEvents form on `/callbacks/{session}`.

use serde::Deserialize;

use callbridge_core::types::Recognition;

pub const SUBSCRIPTION_VALIDATION: &str = "Microsoft.EventGrid.SubscriptionValidationEvent";
pub const INCOMING_CALL: &str = "Microsoft.Communication.IncomingCall";

const CALL_CONNECTED: &str = "Microsoft.Communication.CallConnected";
const CALL_DISCONNECTED: &str = "Microsoft.Communication.CallDisconnected";
const PARTICIPANTS_UPDATED: &str = "Microsoft.Communication.ParticipantsUpdated";
const PLAY_COMPLETED: &str = "Microsoft.Communication.PlayCompleted";
const PLAY_FAILED: &str = "Microsoft.Communication.PlayFailed";
const PLAY_CANCELED: &str = "Microsoft.Communication.PlayCanceled";
const RECOGNIZE_COMPLETED: &str = "Microsoft.Communication.RecognizeCompleted";
const RECOGNIZE_FAILED: &str = "Microsoft.Communication.RecognizeFailed";
const RECOGNIZE_CANCELED: &str = "Microsoft.Communication.RecognizeCanceled";

/// Event Grid schema event.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventGridEvent {
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// CloudEvents schema event used by call callbacks.
#[derive(Debug, Clone, Deserialize)]
pub struct CloudEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    Validation { code: String },
    IncomingCall {
        incoming_call_context: String,
        caller_id: String,
    },
    Ignored(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    CallConnected,
    CallDisconnected,
    ParticipantsUpdated,
    PlayCompleted,
    PlayFailed { reason: String },
    PlayCanceled,
    RecognizeCompleted(Recognition),
    RecognizeFailed { reason: String },
    RecognizeCanceled,
    Unknown(String),
}

impl CallEvent {
    pub fn name(&self) -> &str {
        match self {
            Self::CallConnected => "call_connected",
            Self::CallDisconnected => "call_disconnected",
            Self::ParticipantsUpdated => "participants_updated",
            Self::PlayCompleted => "play_completed",
            Self::PlayFailed { .. } => "play_failed",
            Self::PlayCanceled => "play_canceled",
            Self::RecognizeCompleted(_) => "recognize_completed",
            Self::RecognizeFailed { .. } => "recognize_failed",
            Self::RecognizeCanceled => "recognize_canceled",
            Self::Unknown(name) => name,
        }
    }
}

fn str_at<'a>(value: &'a serde_json::Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(|v| v.as_str())
}

pub fn parse_webhook_event(event: &EventGridEvent) -> WebhookEvent {
    match event.event_type.as_str() {
        SUBSCRIPTION_VALIDATION => match str_at(&event.data, "/validationCode") {
            Some(code) => WebhookEvent::Validation {
                code: code.to_string(),
            },
            None => WebhookEvent::Ignored(event.event_type.clone()),
        },
        INCOMING_CALL => {
            let context = str_at(&event.data, "/incomingCallContext");
            let caller = str_at(&event.data, "/from/rawId");
            match (context, caller) {
                (Some(context), Some(caller)) => WebhookEvent::IncomingCall {
                    incoming_call_context: context.to_string(),
                    caller_id: caller.to_string(),
                },
                _ => WebhookEvent::Ignored(event.event_type.clone()),
            }
        }
        other => WebhookEvent::Ignored(other.to_string()),
    }
}

/// Map a DTMF tone name (`"one"`, `"pound"`, ...) to its key.
fn tone_to_char(tone: &str) -> Option<char> {
    let c = match tone.to_ascii_lowercase().as_str() {
        "zero" | "0" => '0',
        "one" | "1" => '1',
        "two" | "2" => '2',
        "three" | "3" => '3',
        "four" | "4" => '4',
        "five" | "5" => '5',
        "six" | "6" => '6',
        "seven" | "7" => '7',
        "eight" | "8" => '8',
        "nine" | "9" => '9',
        "asterisk" | "*" => '*',
        "pound" | "#" => '#',
        "a" => 'A',
        "b" => 'B',
        "c" => 'C',
        "d" => 'D',
        _ => return None,
    };
    Some(c)
}

/// Collapse the `dtmfResult.tones` array into a digit string.
pub fn tones_to_digits(tones: &serde_json::Value) -> String {
    match tones {
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|t| t.as_str())
            .filter_map(tone_to_char)
            .collect(),
        serde_json::Value::String(s) => s.clone(),
        _ => String::new(),
    }
}

fn failure_reason(data: &serde_json::Value) -> String {
    let message = str_at(data, "/resultInformation/message").unwrap_or("unknown");
    match data.pointer("/resultInformation/subCode").and_then(|v| v.as_i64()) {
        Some(sub) => format!("{message} (subCode {sub})"),
        None => message.to_string(),
    }
}

pub fn parse_call_event(event: &CloudEvent) -> CallEvent {
    let data = &event.data;
    match event.event_type.as_str() {
        CALL_CONNECTED => CallEvent::CallConnected,
        CALL_DISCONNECTED => CallEvent::CallDisconnected,
        PARTICIPANTS_UPDATED => CallEvent::ParticipantsUpdated,
        PLAY_COMPLETED => CallEvent::PlayCompleted,
        PLAY_FAILED => CallEvent::PlayFailed {
            reason: failure_reason(data),
        },
        PLAY_CANCELED => CallEvent::PlayCanceled,
        RECOGNIZE_COMPLETED => match str_at(data, "/recognitionType") {
            Some("speech") => CallEvent::RecognizeCompleted(Recognition::Speech(
                str_at(data, "/speechResult/speech")
                    .unwrap_or_default()
                    .to_string(),
            )),
            Some("dtmf") => CallEvent::RecognizeCompleted(Recognition::Dtmf(tones_to_digits(
                data.pointer("/dtmfResult/tones")
                    .unwrap_or(&serde_json::Value::Null),
            ))),
            other => CallEvent::Unknown(format!(
                "{RECOGNIZE_COMPLETED}:{}",
                other.unwrap_or("none")
            )),
        },
        RECOGNIZE_FAILED => CallEvent::RecognizeFailed {
            reason: failure_reason(data),
        },
        RECOGNIZE_CANCELED => CallEvent::RecognizeCanceled,
        other => CallEvent::Unknown(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cloud(event_type: &str, data: serde_json::Value) -> CloudEvent {
        CloudEvent {
            event_type: event_type.to_string(),
            data,
        }
    }

    #[test]
    fn test_validation_event() {
        let events: Vec<EventGridEvent> = serde_json::from_value(json!([{
            "id": "1",
            "eventType": SUBSCRIPTION_VALIDATION,
            "data": { "validationCode": "abc-123" }
        }]))
        .unwrap();
        assert_eq!(
            parse_webhook_event(&events[0]),
            WebhookEvent::Validation {
                code: "abc-123".into()
            }
        );
    }

    #[test]
    fn test_incoming_call_event() {
        let event: EventGridEvent = serde_json::from_value(json!({
            "eventType": INCOMING_CALL,
            "data": {
                "incomingCallContext": "ctx-token",
                "from": { "kind": "phoneNumber", "rawId": "4:+15550001" },
                "to": { "rawId": "4:+15550002" }
            }
        }))
        .unwrap();
        assert_eq!(
            parse_webhook_event(&event),
            WebhookEvent::IncomingCall {
                incoming_call_context: "ctx-token".into(),
                caller_id: "4:+15550001".into()
            }
        );
    }

    #[test]
    fn test_incoming_call_missing_context_is_ignored() {
        let event: EventGridEvent = serde_json::from_value(json!({
            "eventType": INCOMING_CALL,
            "data": { "from": { "rawId": "4:+1" } }
        }))
        .unwrap();
        assert!(matches!(parse_webhook_event(&event), WebhookEvent::Ignored(_)));
    }

    #[test]
    fn test_call_lifecycle_events() {
        assert_eq!(
            parse_call_event(&cloud(CALL_CONNECTED, json!({}))),
            CallEvent::CallConnected
        );
        assert_eq!(
            parse_call_event(&cloud(PARTICIPANTS_UPDATED, json!({}))),
            CallEvent::ParticipantsUpdated
        );
        assert_eq!(
            parse_call_event(&cloud(PLAY_COMPLETED, json!({}))),
            CallEvent::PlayCompleted
        );
        assert_eq!(
            parse_call_event(&cloud(CALL_DISCONNECTED, json!({}))),
            CallEvent::CallDisconnected
        );
    }

    #[test]
    fn test_speech_recognition() {
        let event = cloud(
            RECOGNIZE_COMPLETED,
            json!({
                "recognitionType": "speech",
                "speechResult": { "speech": "I want to check my balance" }
            }),
        );
        assert_eq!(
            parse_call_event(&event),
            CallEvent::RecognizeCompleted(Recognition::Speech(
                "I want to check my balance".into()
            ))
        );
    }

    #[test]
    fn test_dtmf_recognition() {
        let event = cloud(
            RECOGNIZE_COMPLETED,
            json!({
                "recognitionType": "dtmf",
                "dtmfResult": { "tones": ["one", "two", "three"] }
            }),
        );
        assert_eq!(
            parse_call_event(&event),
            CallEvent::RecognizeCompleted(Recognition::Dtmf("123".into()))
        );
    }

    #[test]
    fn test_tones_to_digits() {
        assert_eq!(tones_to_digits(&json!(["nine", "pound", "asterisk", "zero"])), "9#*0");
        assert_eq!(tones_to_digits(&json!(["bogus"])), "");
        assert_eq!(tones_to_digits(&json!("42")), "42");
        assert_eq!(tones_to_digits(&serde_json::Value::Null), "");
    }

    #[test]
    fn test_failure_events_carry_reason() {
        let event = cloud(
            RECOGNIZE_FAILED,
            json!({
                "resultInformation": {
                    "code": 400,
                    "subCode": 8510,
                    "message": "Action failed, initial silence timeout reached."
                }
            }),
        );
        match parse_call_event(&event) {
            CallEvent::RecognizeFailed { reason } => {
                assert!(reason.contains("initial silence"));
                assert!(reason.contains("8510"));
            }
            other => panic!("unexpected {other:?}"),
        }

        match parse_call_event(&cloud(PLAY_FAILED, json!({}))) {
            CallEvent::PlayFailed { reason } => assert_eq!(reason, "unknown"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_event() {
        let event = cloud("Microsoft.Communication.AddParticipantSucceeded", json!({}));
        assert_eq!(
            parse_call_event(&event).name(),
            "Microsoft.Communication.AddParticipantSucceeded"
        );

        let choices = cloud(RECOGNIZE_COMPLETED, json!({ "recognitionType": "choices" }));
        assert!(matches!(parse_call_event(&choices), CallEvent::Unknown(_)));
    }
}
