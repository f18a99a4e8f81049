//! Per-call session state machine.
//!
//! Call events and bot replies both end up in [`CallSessionMachine::dispatch`],
//! which asks the [`SessionStore`] for the next media command and issues it.
//! The store makes the status check, dequeue and `Playing` write atomic, so
//! at most one play is ever outstanding per call no matter how many webhook
//! deliveries and activity consumers race.

use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use callbridge_bot::ActivityReceiver;
use callbridge_core::config::{Config, RecognizeConfig};
use callbridge_core::error::{BridgeError, Result};
use callbridge_core::session::SessionStore;
use callbridge_core::types::{CallSession, DispatchAction, Recognition};
use callbridge_telephony::CallControl;

use crate::bridge::ConversationBridge;
use crate::events::CallEvent;

/// Tunables the machine reads from config once at startup.
#[derive(Debug, Clone)]
pub struct MachineSettings {
    pub callback_base_url: String,
    pub recognize: RecognizeConfig,
    pub greeting: Option<String>,
}

impl MachineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            callback_base_url: config
                .callback_base_url()
                .unwrap_or_else(|| format!("http://localhost:{}", config.gateway_port())),
            recognize: config.recognize(),
            greeting: config.greeting(),
        }
    }
}

fn report(session_id: &str, what: &str, e: &BridgeError) {
    error!(session_id, kind = e.kind(), %e, "{what} failed");
    #[cfg(feature = "metrics")]
    crate::metrics::record_error(e.kind());
}

pub struct CallSessionMachine {
    store: Arc<SessionStore>,
    calls: Arc<dyn CallControl>,
    bridge: ConversationBridge,
    settings: MachineSettings,
}

impl CallSessionMachine {
    pub fn new(
        store: Arc<SessionStore>,
        calls: Arc<dyn CallControl>,
        bridge: ConversationBridge,
        settings: MachineSettings,
    ) -> Self {
        Self {
            store,
            calls,
            bridge,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Answer an incoming call and register its session. Returns the new
    /// session id.
    pub async fn handle_incoming_call(
        &self,
        incoming_call_context: &str,
        caller_id: &str,
    ) -> Result<String> {
        let session_id = Uuid::new_v4().to_string();
        let callback_uri = format!("{}/callbacks/{session_id}", self.settings.callback_base_url);

        let answered = self
            .calls
            .answer_call(incoming_call_context, &callback_uri)
            .await?;
        self.store.create(CallSession::new(
            session_id.clone(),
            caller_id,
            answered.call_connection_id.clone(),
        ))?;

        #[cfg(feature = "metrics")]
        crate::metrics::record_call_answered();

        info!(
            %session_id,
            caller_id,
            call_connection_id = %answered.call_connection_id,
            "Incoming call answered"
        );
        Ok(session_id)
    }

    /// Route one call event for `session_id`. Events for unknown or ended
    /// sessions are acknowledged and dropped.
    pub async fn handle_call_event(self: &Arc<Self>, session_id: &str, event: CallEvent) {
        if !self.store.contains(session_id) {
            debug!(session_id, event = event.name(), "Ignoring event for unknown session");
            return;
        }
        debug!(session_id, event = event.name(), "Call event");

        match event {
            CallEvent::CallConnected => self.on_call_connected(session_id).await,
            CallEvent::ParticipantsUpdated => {}
            CallEvent::PlayCompleted | CallEvent::PlayCanceled => {
                self.on_play_finished(session_id).await
            }
            CallEvent::PlayFailed { reason } => {
                warn!(session_id, %reason, "Play failed");
                self.on_play_finished(session_id).await
            }
            CallEvent::RecognizeCompleted(recognition) => {
                self.on_recognized(session_id, recognition).await
            }
            CallEvent::RecognizeFailed { reason } => {
                debug!(session_id, %reason, "Recognition ended without input");
                self.dispatch(session_id).await
            }
            CallEvent::RecognizeCanceled => self.dispatch(session_id).await,
            CallEvent::CallDisconnected => self.on_call_ended(session_id).await,
            CallEvent::Unknown(name) => {
                debug!(session_id, event = %name, "Unhandled call event");
            }
        }
    }

    async fn on_call_connected(self: &Arc<Self>, session_id: &str) {
        info!(session_id, "Call connected");
        if let Err(e) = self.store.set_available(session_id) {
            debug!(session_id, %e, "Session vanished before connect completed");
            return;
        }

        match self.bridge.subscribe(session_id).await {
            Ok(rx) => {
                self.spawn_activity_consumer(session_id.to_string(), rx);
            }
            Err(e) => report(session_id, "Bot conversation", &e),
        }

        let greeting = self.settings.greeting.clone();
        self.dispatch_with_prompt(session_id, greeting.as_deref())
            .await;
    }

    /// Drain one session's bot activities in arrival order. Ends when the
    /// connector closes the stream or the session is gone.
    fn spawn_activity_consumer(
        self: &Arc<Self>,
        session_id: String,
        mut rx: ActivityReceiver,
    ) -> tokio::task::JoinHandle<()> {
        let machine = Arc::clone(self);
        tokio::spawn(async move {
            debug!(%session_id, "Activity consumer started");
            while let Some(activity) = rx.recv().await {
                if !machine.store.contains(&session_id) {
                    break;
                }
                if let Some(text) = machine.bridge.accept(&session_id, &activity) {
                    machine.on_bot_message(&session_id, text).await;
                }
            }
            debug!(%session_id, "Activity consumer stopped");
        })
    }

    /// Queue a bot reply and play it if the line is free.
    pub async fn on_bot_message(&self, session_id: &str, text: String) {
        match self.store.enqueue(session_id, text) {
            Ok(pending) => debug!(session_id, pending, "Bot message queued"),
            Err(e) => {
                debug!(session_id, %e, "Dropping bot message");
                return;
            }
        }
        self.dispatch(session_id).await;
    }

    async fn on_play_finished(&self, session_id: &str) {
        if self.store.set_available(session_id).is_err() {
            return;
        }
        self.dispatch(session_id).await;
    }

    async fn on_recognized(&self, session_id: &str, recognition: Recognition) {
        let forwarded = match &recognition {
            Recognition::Speech(text) if text.trim().is_empty() => {
                debug!(session_id, "Empty speech result");
                self.dispatch(session_id).await;
                return;
            }
            Recognition::Speech(text) => {
                info!(session_id, text = %text, "Recognized speech");
                self.bridge.send_text(session_id, text).await
            }
            Recognition::Dtmf(tones) => {
                info!(session_id, tones = %tones, "Recognized DTMF");
                self.bridge.send_dtmf(session_id).await
            }
        };

        #[cfg(feature = "metrics")]
        crate::metrics::record_utterance(match recognition {
            Recognition::Speech(_) => "speech",
            Recognition::Dtmf(_) => "dtmf",
        });

        if let Err(e) = forwarded {
            // No reply will come back to re-arm the line; listen again.
            report(session_id, "Forward to bot", &e);
            self.dispatch(session_id).await;
        }
    }

    async fn on_call_ended(&self, session_id: &str) {
        self.bridge.close(session_id).await;
        if self.store.remove(session_id).is_some() {
            #[cfg(feature = "metrics")]
            crate::metrics::record_call_ended();
            info!(session_id, "Call ended");
        }
    }

    /// Issue the next media command for a call, if any.
    pub async fn dispatch(&self, session_id: &str) {
        self.dispatch_with_prompt(session_id, None).await;
    }

    /// As [`dispatch`](Self::dispatch); `prompt` is spoken by a resulting
    /// listen, never by a play.
    pub async fn dispatch_with_prompt(&self, session_id: &str, prompt: Option<&str>) {
        loop {
            match self.store.next_action(session_id) {
                DispatchAction::Hold => {
                    debug!(session_id, "Media operation in flight, holding");
                    return;
                }
                DispatchAction::Play { session, message } => {
                    debug!(session_id, %message, "Playing bot message");
                    #[cfg(feature = "metrics")]
                    crate::metrics::record_command("play");
                    match self
                        .calls
                        .play(&session.call_connection_id, &message, &session.caller_id)
                        .await
                    {
                        Ok(()) => return,
                        Err(e) => {
                            // Rejected outright: no completion event will
                            // follow. The message is not re-queued.
                            report(session_id, "Play", &e);
                            if self.store.set_available(session_id).is_err() {
                                return;
                            }
                        }
                    }
                }
                DispatchAction::Listen { session } => {
                    debug!(session_id, prompt = prompt.is_some(), "Queue drained, listening");
                    #[cfg(feature = "metrics")]
                    crate::metrics::record_command("listen");
                    if let Err(e) = self
                        .calls
                        .listen(
                            &session.call_connection_id,
                            &session.caller_id,
                            prompt,
                            &self.settings.recognize,
                        )
                        .await
                    {
                        report(session_id, "Listen", &e);
                    }
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use callbridge_bot::BotConnector;
    use callbridge_core::types::{Activity, MediaStatus};
    use callbridge_telephony::AnsweredCall;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Command {
        Play(String),
        Listen(Option<String>),
    }

    #[derive(Default)]
    struct FakeCalls {
        commands: Mutex<Vec<Command>>,
        fail_plays: Mutex<usize>,
    }

    impl FakeCalls {
        fn commands(&self) -> Vec<Command> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CallControl for FakeCalls {
        fn id(&self) -> &str {
            "fake"
        }

        async fn answer_call(&self, _ctx: &str, _callback: &str) -> Result<AnsweredCall> {
            Ok(AnsweredCall {
                call_connection_id: "conn-1".into(),
            })
        }

        async fn play(&self, _conn: &str, text: &str, _target: &str) -> Result<()> {
            let mut failures = self.fail_plays.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(BridgeError::RemoteCommand("play rejected".into()));
            }
            self.commands
                .lock()
                .unwrap()
                .push(Command::Play(text.to_string()));
            Ok(())
        }

        async fn listen(
            &self,
            _conn: &str,
            _target: &str,
            prompt: Option<&str>,
            _options: &RecognizeConfig,
        ) -> Result<()> {
            self.commands
                .lock()
                .unwrap()
                .push(Command::Listen(prompt.map(str::to_string)));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeBot {
        posted: Mutex<Vec<Activity>>,
        senders: Mutex<Vec<mpsc::Sender<Activity>>>,
        unavailable: bool,
    }

    #[async_trait]
    impl BotConnector for FakeBot {
        fn id(&self) -> &str {
            "fake"
        }

        async fn open(&self, session_id: &str) -> Result<ActivityReceiver> {
            if self.unavailable {
                return Err(BridgeError::StreamUnavailable(session_id.to_string()));
            }
            let (tx, rx) = mpsc::channel(16);
            self.senders.lock().unwrap().push(tx);
            Ok(rx)
        }

        async fn post(&self, session_id: &str, activity: Activity) -> Result<()> {
            if self.unavailable {
                return Err(BridgeError::StreamUnavailable(session_id.to_string()));
            }
            self.posted.lock().unwrap().push(activity);
            Ok(())
        }

        async fn close(&self, _session_id: &str) {
            self.senders.lock().unwrap().clear();
        }
    }

    struct Harness {
        machine: Arc<CallSessionMachine>,
        calls: Arc<FakeCalls>,
        bot: Arc<FakeBot>,
    }

    fn harness_with(bot: FakeBot, greeting: Option<&str>) -> Harness {
        let calls = Arc::new(FakeCalls::default());
        let bot = Arc::new(bot);
        let machine = Arc::new(CallSessionMachine::new(
            Arc::new(SessionStore::new()),
            calls.clone(),
            ConversationBridge::new(bot.clone(), Some("bot-1".into())),
            MachineSettings {
                callback_base_url: "https://cb.example.com".into(),
                recognize: RecognizeConfig::default(),
                greeting: greeting.map(str::to_string),
            },
        ));
        Harness { machine, calls, bot }
    }

    fn harness() -> Harness {
        harness_with(FakeBot::default(), None)
    }

    async fn connected(h: &Harness) -> String {
        let id = h
            .machine
            .handle_incoming_call("ctx", "4:+15550001")
            .await
            .unwrap();
        h.machine
            .handle_call_event(&id, CallEvent::CallConnected)
            .await;
        id
    }

    #[tokio::test]
    async fn test_incoming_call_registers_session() {
        let h = harness();
        let id = h
            .machine
            .handle_incoming_call("ctx", "4:+15550001")
            .await
            .unwrap();
        let session = h.machine.store().get(&id).unwrap();
        assert_eq!(session.caller_id, "4:+15550001");
        assert_eq!(session.call_connection_id, "conn-1");
        assert_eq!(
            h.machine.store().media_status(&id),
            MediaStatus::Uninitialized
        );
    }

    #[tokio::test]
    async fn test_connect_listens_without_prompt() {
        let h = harness();
        let id = connected(&h).await;
        assert_eq!(h.calls.commands(), vec![Command::Listen(None)]);
        assert!(h.machine.store().is_available(&id));
        assert_eq!(h.bot.senders.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_connect_with_greeting_prompts() {
        let h = harness_with(FakeBot::default(), Some("Hello, how can I help you?"));
        connected(&h).await;
        assert_eq!(
            h.calls.commands(),
            vec![Command::Listen(Some("Hello, how can I help you?".into()))]
        );
    }

    #[tokio::test]
    async fn test_bot_message_plays_when_available() {
        let h = harness();
        let id = connected(&h).await;

        h.machine.on_bot_message(&id, "Hi there".into()).await;
        assert_eq!(
            h.calls.commands(),
            vec![Command::Listen(None), Command::Play("Hi there".into())]
        );
        assert_eq!(h.machine.store().media_status(&id), MediaStatus::Playing);
    }

    #[tokio::test]
    async fn test_messages_queue_while_playing_and_drain_in_order() {
        let h = harness();
        let id = connected(&h).await;

        h.machine.on_bot_message(&id, "X".into()).await;
        h.machine.on_bot_message(&id, "A".into()).await;
        h.machine.on_bot_message(&id, "B".into()).await;
        // Only X is in flight
        assert_eq!(
            h.calls.commands(),
            vec![Command::Listen(None), Command::Play("X".into())]
        );
        assert_eq!(h.machine.store().queue_len(&id), 2);

        h.machine
            .handle_call_event(&id, CallEvent::PlayCompleted)
            .await;
        h.machine
            .handle_call_event(&id, CallEvent::PlayCompleted)
            .await;
        h.machine
            .handle_call_event(&id, CallEvent::PlayCompleted)
            .await;

        assert_eq!(
            h.calls.commands(),
            vec![
                Command::Listen(None),
                Command::Play("X".into()),
                Command::Play("A".into()),
                Command::Play("B".into()),
                Command::Listen(None),
            ]
        );
        assert!(h.machine.store().is_available(&id));
    }

    #[tokio::test]
    async fn test_dispatch_while_playing_is_noop() {
        let h = harness();
        let id = connected(&h).await;
        h.machine.on_bot_message(&id, "X".into()).await;
        let before = h.calls.commands();

        h.machine.dispatch(&id).await;
        h.machine
            .handle_call_event(&id, CallEvent::RecognizeFailed {
                reason: "timeout".into(),
            })
            .await;
        assert_eq!(h.calls.commands(), before);
    }

    #[tokio::test]
    async fn test_message_before_connect_waits() {
        let h = harness();
        let id = h
            .machine
            .handle_incoming_call("ctx", "4:+15550001")
            .await
            .unwrap();
        h.machine.on_bot_message(&id, "early".into()).await;
        assert!(h.calls.commands().is_empty());

        h.machine
            .handle_call_event(&id, CallEvent::CallConnected)
            .await;
        assert_eq!(h.calls.commands(), vec![Command::Play("early".into())]);
    }

    #[tokio::test]
    async fn test_speech_forwarded_not_queued() {
        let h = harness();
        let id = connected(&h).await;
        h.machine
            .handle_call_event(
                &id,
                CallEvent::RecognizeCompleted(Recognition::Speech("check my balance".into())),
            )
            .await;

        let posted = h.bot.posted.lock().unwrap().clone();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].text.as_deref(), Some("check my balance"));
        assert_eq!(posted[0].from_id(), Some(id.as_str()));
        assert_eq!(h.machine.store().queue_len(&id), 0);
        assert_eq!(h.calls.commands(), vec![Command::Listen(None)]);
    }

    #[tokio::test]
    async fn test_dtmf_forwarded_as_marker() {
        let h = harness();
        let id = connected(&h).await;
        h.machine
            .handle_call_event(
                &id,
                CallEvent::RecognizeCompleted(Recognition::Dtmf("123".into())),
            )
            .await;

        let posted = h.bot.posted.lock().unwrap().clone();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].text.as_deref(), Some("/DTMFKey #"));
        assert_eq!(h.machine.store().queue_len(&id), 0);
        assert!(
            !h.calls
                .commands()
                .iter()
                .any(|c| matches!(c, Command::Play(_)))
        );
    }

    #[tokio::test]
    async fn test_empty_speech_relistens() {
        let h = harness();
        let id = connected(&h).await;
        h.machine
            .handle_call_event(
                &id,
                CallEvent::RecognizeCompleted(Recognition::Speech(" ".into())),
            )
            .await;
        assert!(h.bot.posted.lock().unwrap().is_empty());
        assert_eq!(
            h.calls.commands(),
            vec![Command::Listen(None), Command::Listen(None)]
        );
    }

    #[tokio::test]
    async fn test_forward_failure_relistens() {
        let h = harness_with(
            FakeBot {
                unavailable: true,
                ..FakeBot::default()
            },
            None,
        );
        let id = connected(&h).await;
        h.machine
            .handle_call_event(
                &id,
                CallEvent::RecognizeCompleted(Recognition::Speech("hello".into())),
            )
            .await;
        assert_eq!(
            h.calls.commands(),
            vec![Command::Listen(None), Command::Listen(None)]
        );
    }

    #[tokio::test]
    async fn test_recognize_timeout_rearms_listen() {
        let h = harness();
        let id = connected(&h).await;
        h.machine
            .handle_call_event(&id, CallEvent::RecognizeFailed {
                reason: "initial silence timeout".into(),
            })
            .await;
        assert_eq!(
            h.calls.commands(),
            vec![Command::Listen(None), Command::Listen(None)]
        );
    }

    #[tokio::test]
    async fn test_failed_play_moves_to_next_message() {
        let h = harness();
        let id = connected(&h).await;
        h.machine.on_bot_message(&id, "X".into()).await;
        h.machine.on_bot_message(&id, "A".into()).await;

        h.machine
            .handle_call_event(&id, CallEvent::PlayFailed {
                reason: "media unavailable".into(),
            })
            .await;
        assert_eq!(
            h.calls.commands(),
            vec![
                Command::Listen(None),
                Command::Play("X".into()),
                Command::Play("A".into()),
            ]
        );
        assert_eq!(h.machine.store().media_status(&id), MediaStatus::Playing);
        assert_eq!(h.machine.store().queue_len(&id), 0);
    }

    #[tokio::test]
    async fn test_canceled_play_frees_the_line() {
        let h = harness();
        let id = connected(&h).await;
        h.machine.on_bot_message(&id, "X".into()).await;

        h.machine
            .handle_call_event(&id, CallEvent::PlayCanceled)
            .await;
        assert_eq!(
            h.calls.commands(),
            vec![
                Command::Listen(None),
                Command::Play("X".into()),
                Command::Listen(None),
            ]
        );
        assert!(h.machine.store().is_available(&id));
    }

    #[tokio::test]
    async fn test_recognize_canceled_relistens() {
        let h = harness();
        let id = connected(&h).await;
        h.machine
            .handle_call_event(&id, CallEvent::RecognizeCanceled)
            .await;
        assert_eq!(
            h.calls.commands(),
            vec![Command::Listen(None), Command::Listen(None)]
        );
    }

    #[tokio::test]
    async fn test_rejected_play_moves_on() {
        let h = harness();
        let id = connected(&h).await;
        h.machine.store().enqueue(&id, "doomed").unwrap();
        h.machine.store().enqueue(&id, "next").unwrap();
        *h.calls.fail_plays.lock().unwrap() = 1;

        h.machine.dispatch(&id).await;
        assert_eq!(
            h.calls.commands(),
            vec![Command::Listen(None), Command::Play("next".into())]
        );
        assert_eq!(h.machine.store().media_status(&id), MediaStatus::Playing);
        assert_eq!(h.machine.store().queue_len(&id), 0);
    }

    #[tokio::test]
    async fn test_unknown_session_is_ignored() {
        let h = harness();
        h.machine
            .handle_call_event("ghost", CallEvent::CallConnected)
            .await;
        h.machine
            .handle_call_event("ghost", CallEvent::PlayCompleted)
            .await;
        h.machine.on_bot_message("ghost", "hello".into()).await;

        assert!(h.calls.commands().is_empty());
        assert!(h.machine.store().is_empty());
        assert_eq!(h.machine.store().queue_len("ghost"), 0);
        assert_eq!(
            h.machine.store().media_status("ghost"),
            MediaStatus::Uninitialized
        );
    }

    #[tokio::test]
    async fn test_disconnect_removes_everything() {
        let h = harness();
        let id = connected(&h).await;
        h.machine.on_bot_message(&id, "X".into()).await;
        h.machine.on_bot_message(&id, "Y".into()).await;

        h.machine
            .handle_call_event(&id, CallEvent::CallDisconnected)
            .await;
        assert!(h.machine.store().get(&id).is_err());
        assert_eq!(h.machine.store().queue_len(&id), 0);
        assert_eq!(
            h.machine.store().media_status(&id),
            MediaStatus::Uninitialized
        );
        assert!(h.bot.senders.lock().unwrap().is_empty());

        // Late completion for the ended call
        h.machine
            .handle_call_event(&id, CallEvent::PlayCompleted)
            .await;
        assert_eq!(h.calls.commands().len(), 2);
    }

    #[tokio::test]
    async fn test_bot_stream_feeds_queue() {
        let h = harness();
        let id = connected(&h).await;
        let tx = h.bot.senders.lock().unwrap()[0].clone();

        let mut reply = Activity::message("bot-1", "Welcome!");
        reply.speak = Some("Welcome to the line".into());
        tx.send(Activity::message(id.clone(), "echo of caller"))
            .await
            .unwrap();
        tx.send(reply).await.unwrap();

        for _ in 0..50 {
            if h.calls.commands().len() >= 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(
            h.calls.commands(),
            vec![
                Command::Listen(None),
                Command::Play("Welcome to the line".into())
            ]
        );
    }

    #[tokio::test]
    async fn test_connect_survives_bot_outage() {
        let h = harness_with(
            FakeBot {
                unavailable: true,
                ..FakeBot::default()
            },
            None,
        );
        let id = connected(&h).await;
        assert!(h.machine.store().is_available(&id));
        assert_eq!(h.calls.commands(), vec![Command::Listen(None)]);
    }
}
