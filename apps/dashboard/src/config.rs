use std::{fs, path::Path, path::PathBuf, time::Duration};

use anyhow::{bail, Context};
use lab_core::{mqtt::BrokerEndpoint, BrokerSettings, SupervisorConfig};
use lab_shared::{
    domain::{StageList, DEFAULT_MAX_CYCLES},
    protocol::{TopicMap, DEFAULT_TOPIC_PREFIX},
};
use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_CONFIG_FILE: &str = "dashboard.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct DashboardSettings {
    pub api_base_url: String,
    pub broker_url: String,
    pub broker_username: Option<String>,
    pub broker_password: Option<String>,
    pub client_id_prefix: String,
    pub keep_alive_secs: u64,
    pub reconnect_secs: u64,
    pub connect_timeout_secs: u64,
    pub topic_prefix: String,
    pub stages: Vec<String>,
    pub max_cycles: u32,
    pub dissolution_wait_secs: u64,
    /// Keeps the broker client identity on disk; in memory when unset.
    pub session_file: Option<PathBuf>,
}

impl Default for DashboardSettings {
    fn default() -> Self {
        let broker = BrokerSettings::default();
        Self {
            api_base_url: "http://localhost:5000".into(),
            broker_url: broker.url,
            broker_username: None,
            broker_password: None,
            client_id_prefix: broker.client_id_prefix,
            keep_alive_secs: broker.keep_alive.as_secs(),
            reconnect_secs: broker.reconnect_period.as_secs(),
            connect_timeout_secs: broker.connect_timeout.as_secs(),
            topic_prefix: DEFAULT_TOPIC_PREFIX.into(),
            stages: StageList::default().names().to_vec(),
            max_cycles: DEFAULT_MAX_CYCLES,
            dissolution_wait_secs: 600,
            session_file: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    api_base_url: Option<String>,
    broker_url: Option<String>,
    broker_username: Option<String>,
    broker_password: Option<String>,
    client_id_prefix: Option<String>,
    keep_alive_secs: Option<u64>,
    reconnect_secs: Option<u64>,
    connect_timeout_secs: Option<u64>,
    topic_prefix: Option<String>,
    stages: Option<Vec<String>>,
    max_cycles: Option<u32>,
    dissolution_wait_secs: Option<u64>,
    session_file: Option<PathBuf>,
}

impl DashboardSettings {
    pub fn topics(&self) -> TopicMap {
        TopicMap::with_prefix(&self.topic_prefix)
    }

    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            url: self.broker_url.clone(),
            username: self.broker_username.clone(),
            password: self.broker_password.clone(),
            client_id_prefix: self.client_id_prefix.clone(),
            keep_alive: Duration::from_secs(self.keep_alive_secs),
            reconnect_period: Duration::from_secs(self.reconnect_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            subscriptions: self.topics().inbound(),
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            topics: self.topics(),
            stages: StageList::new(self.stages.iter().cloned()),
            max_cycles: self.max_cycles,
            dissolution_wait: Duration::from_secs(self.dissolution_wait_secs),
        }
    }

    /// Rejects settings that would only fail later at connect time.
    pub fn validate(&self) -> anyhow::Result<()> {
        BrokerEndpoint::parse(&self.broker_url)
            .with_context(|| format!("invalid broker url '{}'", self.broker_url))?;
        if !(self.api_base_url.starts_with("http://") || self.api_base_url.starts_with("https://")) {
            bail!("api base url '{}' must be http or https", self.api_base_url);
        }
        if self.stages.is_empty() {
            bail!("stage list must not be empty");
        }
        if self.max_cycles == 0 {
            bail!("max_cycles must be at least 1");
        }
        Ok(())
    }

    fn apply_file(&mut self, file: FileSettings) {
        if let Some(v) = file.api_base_url {
            self.api_base_url = v;
        }
        if let Some(v) = file.broker_url {
            self.broker_url = v;
        }
        if file.broker_username.is_some() {
            self.broker_username = file.broker_username;
        }
        if file.broker_password.is_some() {
            self.broker_password = file.broker_password;
        }
        if let Some(v) = file.client_id_prefix {
            self.client_id_prefix = v;
        }
        if let Some(v) = file.keep_alive_secs {
            self.keep_alive_secs = v;
        }
        if let Some(v) = file.reconnect_secs {
            self.reconnect_secs = v;
        }
        if let Some(v) = file.connect_timeout_secs {
            self.connect_timeout_secs = v;
        }
        if let Some(v) = file.topic_prefix {
            self.topic_prefix = v;
        }
        if let Some(v) = file.stages.filter(|stages| !stages.is_empty()) {
            self.stages = v;
        }
        if let Some(v) = file.max_cycles {
            self.max_cycles = v;
        }
        if let Some(v) = file.dissolution_wait_secs {
            self.dissolution_wait_secs = v;
        }
        if file.session_file.is_some() {
            self.session_file = file.session_file;
        }
    }
}

pub fn load_settings(path: &Path) -> DashboardSettings {
    load_settings_with(path, |key| std::env::var(key).ok())
}

/// Defaults, then the optional toml file, then environment overrides.
pub fn load_settings_with(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> DashboardSettings {
    let mut settings = DashboardSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => settings.apply_file(file_cfg),
            Err(err) => warn!(path = %path.display(), error = %err, "config: ignoring unreadable settings file"),
        }
    }

    if let Some(v) = env("DASHBOARD_API_BASE_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = env("APP__API_BASE_URL") {
        settings.api_base_url = v;
    }

    if let Some(v) = env("DASHBOARD_BROKER_URL") {
        settings.broker_url = v;
    }
    if let Some(v) = env("DASHBOARD_BROKER_USERNAME") {
        settings.broker_username = Some(v);
    }
    if let Some(v) = env("DASHBOARD_BROKER_PASSWORD") {
        settings.broker_password = Some(v);
    }

    if let Some(v) = env("DASHBOARD_TOPIC_PREFIX") {
        settings.topic_prefix = v;
    }

    if let Some(v) = env("DASHBOARD_MAX_CYCLES") {
        match v.parse::<u32>() {
            Ok(parsed) => settings.max_cycles = parsed,
            Err(_) => warn!(value = %v, "config: DASHBOARD_MAX_CYCLES is not a number"),
        }
    }
    if let Some(v) = env("DASHBOARD_DISSOLUTION_WAIT_SECS") {
        match v.parse::<u64>() {
            Ok(parsed) => settings.dissolution_wait_secs = parsed,
            Err(_) => warn!(value = %v, "config: DASHBOARD_DISSOLUTION_WAIT_SECS is not a number"),
        }
    }

    settings
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
