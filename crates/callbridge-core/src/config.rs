//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level Call Bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub telephony: Option<TelephonyConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot: Option<BotConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

// --- Gateway ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// Public base URL the call-control service posts call events to
    /// (e.g. `https://example.ngrok.app`). `/callbacks/<session>` is appended.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_base_url: Option<String>,
}

fn default_port() -> u16 {
    3000
}

// --- Telephony (Azure Communication Services) ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelephonyConfig {
    /// `endpoint=https://<resource>.communication.azure.com/;accesskey=<base64>`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_string_env: Option<String>,

    /// Cognitive Services endpoint used for speech recognition and TTS.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cognitive_services_endpoint: Option<String>,

    #[serde(default = "default_voice_name")]
    pub voice_name: String,

    #[serde(default = "default_api_version")]
    pub api_version: String,

    #[serde(default)]
    pub recognize: RecognizeConfig,
}

fn default_voice_name() -> String {
    "en-US-NancyNeural".into()
}

fn default_api_version() -> String {
    "2023-10-15".into()
}

impl TelephonyConfig {
    pub fn resolve_connection_string(&self) -> Option<String> {
        resolve_secret_field(&self.connection_string, &self.connection_string_env)
    }
}

/// Timeouts and limits applied to every speech/DTMF recognition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizeConfig {
    #[serde(default = "default_initial_silence")]
    pub initial_silence_timeout_secs: u32,

    #[serde(default = "default_end_silence")]
    pub end_silence_timeout_secs: u32,

    #[serde(default = "default_max_tones")]
    pub max_tones_to_collect: u32,

    #[serde(default)]
    pub interrupt_prompt: bool,
}

fn default_initial_silence() -> u32 {
    15
}

fn default_end_silence() -> u32 {
    1
}

fn default_max_tones() -> u32 {
    1
}

impl Default for RecognizeConfig {
    fn default() -> Self {
        Self {
            initial_silence_timeout_secs: default_initial_silence(),
            end_silence_timeout_secs: default_end_silence(),
            max_tones_to_collect: default_max_tones(),
            interrupt_prompt: false,
        }
    }
}

// --- Bot (Direct Line) ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Token endpoint handing out Direct Line tokens bound to a new conversation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_endpoint_env: Option<String>,

    /// `from.id` of activities authored by the bot. Everything else is ignored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_id_env: Option<String>,

    #[serde(default = "default_directline_url")]
    pub directline_url: String,

    /// Capacity of the per-call inbound activity channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Prompt spoken by the first recognition after the call connects.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub greeting: Option<String>,
}

fn default_directline_url() -> String {
    "https://directline.botframework.com/v3/directline".into()
}

fn default_channel_capacity() -> usize {
    64
}

impl BotConfig {
    pub fn resolve_token_endpoint(&self) -> Option<String> {
        resolve_secret_field(&self.token_endpoint, &self.token_endpoint_env)
    }

    pub fn resolve_bot_id(&self) -> Option<String> {
        resolve_secret_field(&self.bot_id, &self.bot_id_env)
    }
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            token_endpoint: None,
            token_endpoint_env: None,
            bot_id: None,
            bot_id_env: None,
            directline_url: default_directline_url(),
            channel_capacity: default_channel_capacity(),
            greeting: None,
        }
    }
}

// --- Logging ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "callbridge_gateway=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> crate::error::Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| crate::error::BridgeError::Config(e.to_string()))?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned())
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    /// Parse config text (JSON5).
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let substituted = substitute_env_vars(raw)?;
        json5::from_str(&substituted).map_err(|e| crate::error::BridgeError::Config(e.to_string()))
    }

    /// Default config file location: `~/.callbridge/config.json`
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or_else(default_port)
    }

    pub fn bind_addr(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    /// Callback base URL without a trailing slash.
    pub fn callback_base_url(&self) -> Option<String> {
        self.gateway
            .as_ref()
            .and_then(|g| g.callback_base_url.as_deref())
            .map(|u| u.trim_end_matches('/').to_string())
    }

    pub fn recognize(&self) -> RecognizeConfig {
        self.telephony
            .as_ref()
            .map(|t| t.recognize.clone())
            .unwrap_or_default()
    }

    pub fn bot(&self) -> BotConfig {
        self.bot.clone().unwrap_or_default()
    }

    pub fn greeting(&self) -> Option<String> {
        self.bot
            .as_ref()
            .and_then(|b| b.greeting.clone())
            .filter(|g| !g.is_empty())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        match &self.telephony {
            Some(t) => {
                match t.resolve_connection_string() {
                    Some(cs)
                        if !connection_string_has(&cs, "endpoint")
                            || !connection_string_has(&cs, "accesskey") =>
                    {
                        errors.push(
                            "Telephony connection string must contain endpoint= and accesskey="
                                .to_string(),
                        );
                    }
                    Some(_) => {}
                    None => errors.push("Telephony connection string is not configured".into()),
                }
                if t.cognitive_services_endpoint.is_none() {
                    warnings.push(
                        "No cognitive services endpoint configured; speech recognition will fail"
                            .to_string(),
                    );
                }
            }
            None => errors.push("Missing telephony section".to_string()),
        }

        match &self.bot {
            Some(b) => {
                if b.resolve_token_endpoint().is_none() {
                    errors.push("Bot token endpoint is not configured".to_string());
                }
                if b.resolve_bot_id().is_none() {
                    warnings.push(
                        "No bot id configured; every inbound message activity will be played"
                            .to_string(),
                    );
                }
                if b.channel_capacity == 0 {
                    errors.push("Bot channel capacity cannot be 0".to_string());
                }
            }
            None => errors.push("Missing bot section".to_string()),
        }

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
        }
        if self.callback_base_url().is_none() {
            errors.push("gateway.callback_base_url is not configured".to_string());
        }

        (warnings, errors)
    }
}

/// Whether a `key=value;...` connection string carries `key` (any case).
fn connection_string_has(raw: &str, key: &str) -> bool {
    raw.split(';')
        .filter_map(|part| part.trim().split_once('='))
        .any(|(k, _)| k.eq_ignore_ascii_case(key))
}

/// Base directory for Call Bridge data: `~/.callbridge/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".callbridge")
}
