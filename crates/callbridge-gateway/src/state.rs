//! Gateway shared state.

use std::sync::Arc;

use callbridge_core::config::Config;
use callbridge_core::session::SessionStore;
use callbridge_telephony::CallControl;

use crate::bridge::ConversationBridge;
use crate::machine::{CallSessionMachine, MachineSettings};

/// Shared state accessible from all HTTP handlers.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionStore>,
    pub machine: Arc<CallSessionMachine>,
    #[cfg(feature = "metrics")]
    pub prometheus: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl GatewayState {
    pub fn new(
        config: Arc<Config>,
        calls: Arc<dyn CallControl>,
        bridge: ConversationBridge,
    ) -> Self {
        let sessions = Arc::new(SessionStore::new());
        let machine = Arc::new(CallSessionMachine::new(
            sessions.clone(),
            calls,
            bridge,
            MachineSettings::from_config(&config),
        ));

        Self {
            config,
            sessions,
            machine,
            #[cfg(feature = "metrics")]
            prometheus: None,
        }
    }

    #[cfg(feature = "metrics")]
    pub fn with_prometheus(
        mut self,
        handle: metrics_exporter_prometheus::PrometheusHandle,
    ) -> Self {
        self.prometheus = Some(handle);
        self
    }
}
