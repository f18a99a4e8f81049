//! Bot conversation abstraction.
//!
//! Every call owns one conversation with the bot service. A
//! [`BotConnector`] opens that conversation, streams the bot's activities
//! back over a bounded channel, and posts the caller's utterances.

use async_trait::async_trait;
use tokio::sync::mpsc;

use callbridge_core::error::Result;
use callbridge_core::types::Activity;

#[cfg(feature = "directline")]
pub mod directline;

/// Receiver for inbound activities of one conversation.
pub type ActivityReceiver = mpsc::Receiver<Activity>;

/// Sender for inbound activities (used by connector implementations).
pub type ActivitySender = mpsc::Sender<Activity>;

#[async_trait]
pub trait BotConnector: Send + Sync {
    /// Connector identifier (e.g. "directline").
    fn id(&self) -> &str;

    /// Create the conversation for `session_id`, or resume it if one exists.
    ///
    /// Resuming recreates the activity stream: the previous receiver is
    /// closed and delivery continues on the returned one from the last
    /// acknowledged position.
    async fn open(&self, session_id: &str) -> Result<ActivityReceiver>;

    /// Post an activity into the conversation of `session_id`.
    async fn post(&self, session_id: &str, activity: Activity) -> Result<()>;

    /// Stop streaming and forget the conversation. Unknown ids are ignored.
    async fn close(&self, session_id: &str);
}
