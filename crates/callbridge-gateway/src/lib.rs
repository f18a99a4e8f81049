//! HTTP gateway bridging phone calls to a bot conversation.
//!
//! The gateway receives call-control webhooks, answers incoming calls,
//! and drives one [`CallSessionMachine`] session per call: bot replies are
//! queued and played one at a time, and the caller's speech or keypad
//! input is forwarded back to the bot.

pub mod bridge;
pub mod events;
pub mod machine;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod server;
pub mod state;

pub use bridge::ConversationBridge;
pub use machine::{CallSessionMachine, MachineSettings};
pub use server::{build_router, start_gateway};
pub use state::GatewayState;
