//! Call-control abstraction.
//!
//! The session state machine only ever talks to a [`CallControl`]; the
//! Azure Communication Services client behind the `acs` feature is the
//! production implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use callbridge_core::config::RecognizeConfig;
use callbridge_core::error::Result;

#[cfg(feature = "acs")]
pub mod acs;

/// Result of answering an incoming call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnsweredCall {
    pub call_connection_id: String,
}

/// Remote call-control operations. Every method returns once the service
/// has accepted the command; completion arrives later as a call event.
#[async_trait]
pub trait CallControl: Send + Sync {
    /// Provider identifier (e.g. "acs").
    fn id(&self) -> &str;

    /// Answer an incoming call; call events are posted to `callback_uri`.
    async fn answer_call(
        &self,
        incoming_call_context: &str,
        callback_uri: &str,
    ) -> Result<AnsweredCall>;

    /// Speak `text` to `target` on the call.
    async fn play(&self, call_connection_id: &str, text: &str, target: &str) -> Result<()>;

    /// Start speech/DTMF recognition against `target`, optionally speaking
    /// `prompt` first.
    async fn listen(
        &self,
        call_connection_id: &str,
        target: &str,
        prompt: Option<&str>,
        options: &RecognizeConfig,
    ) -> Result<()>;
}
