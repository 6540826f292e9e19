//! Agent configuration
//!
//! Read from an optional TOML file (`AGENT_CONFIG`, default `agent.toml`)
//! layered under `AGENT__*` environment variables, e.g.
//! `AGENT__SUPERVISOR__RETRY_BACKOFF_MS=5000`.

use agent_lib::dosing::DosingConfig;
use agent_lib::sampler::SamplerConfig;
use agent_lib::sequence::SetpointSequence;
use agent_lib::supervisor::StartupWrite;
use agent_lib::tracker::{ContinuityPolicy, TrackerConfig};
use agent_lib::{
    ConfigError, Credentials, EndpointConfig, NodeId, SignalAddress, SignalValue,
    SupervisorConfig, ValueType,
};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Station name attached to every structured event
    #[serde(default = "default_station_name")]
    pub station_name: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default)]
    pub endpoint: EndpointSection,

    #[serde(default)]
    pub watch: WatchSection,

    #[serde(default)]
    pub tracker: TrackerConfig,

    #[serde(default)]
    pub supervisor: SupervisorSection,

    /// Outputs that follow the watched signal
    #[serde(default)]
    pub mirror_targets: Vec<SignalAddress>,

    pub dosing: Option<DosingSection>,

    #[serde(default)]
    pub startup_writes: Vec<StartupWriteSection>,

    pub sequence: Option<SequenceSection>,

    pub sampler: Option<SamplerSection>,

    #[serde(default)]
    pub records: RecordsSection,

    #[serde(default)]
    pub simulation: SimulationSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointSection {
    #[serde(default = "default_endpoint_url")]
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub certificate: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
}

impl Default for EndpointSection {
    fn default() -> Self {
        Self {
            url: default_endpoint_url(),
            username: None,
            password: None,
            certificate: None,
            private_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchSection {
    /// Node id of the boolean "machine active" signal
    #[serde(default = "default_watched_node")]
    pub node: String,
    #[serde(default = "default_sampling_interval_ms")]
    pub sampling_interval_ms: u64,
}

impl Default for WatchSection {
    fn default() -> Self {
        Self {
            node: default_watched_node(),
            sampling_interval_ms: default_sampling_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSection {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default)]
    pub continuity: ContinuityPolicy,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            continuity: ContinuityPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DosingSection {
    /// Boolean interlock output
    pub interlock: NodeId,
    #[serde(default = "default_batch_time_ms")]
    pub batch_time_ms: u64,
    #[serde(default = "default_min_pause_ms")]
    pub min_pause_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartupWriteSection {
    pub node: NodeId,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    pub value: SignalValue,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SequenceSection {
    pub targets: Vec<SignalAddress>,
    /// One column of values per target
    pub columns: Vec<Vec<SignalValue>>,
    pub step_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SamplerSection {
    pub node: NodeId,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    #[serde(default = "default_sampler_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_log_every")]
    pub log_every: u64,
}

/// CSV files; a missing path disables that sink
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordsSection {
    pub cycles: Option<PathBuf>,
    pub samples: Option<PathBuf>,
}

/// Schedule of the simulated machine behind `sim://` endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct SimulationSection {
    #[serde(default = "default_active_ms")]
    pub active_ms: u64,
    #[serde(default = "default_idle_ms")]
    pub idle_ms: u64,
}

impl Default for SimulationSection {
    fn default() -> Self {
        Self {
            active_ms: default_active_ms(),
            idle_ms: default_idle_ms(),
        }
    }
}

fn default_station_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_endpoint_url() -> String {
    "sim://localhost".to_string()
}

fn default_watched_node() -> String {
    "ns=2;s=Tags.GECO/MP_Mixer_Run".to_string()
}

fn default_sampling_interval_ms() -> u64 {
    100
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_retry_backoff_ms() -> u64 {
    2000
}

fn default_batch_time_ms() -> u64 {
    5000
}

fn default_min_pause_ms() -> u64 {
    20_000
}

fn default_sampler_interval_ms() -> u64 {
    100
}

fn default_log_every() -> u64 {
    100
}

fn default_active_ms() -> u64 {
    5000
}

fn default_idle_ms() -> u64 {
    25_000
}

impl AgentConfig {
    /// Load configuration from the config file and environment
    pub fn load() -> Result<Self> {
        let path = std::env::var("AGENT_CONFIG").unwrap_or_else(|_| "agent.toml".to_string());

        let config = config::Config::builder()
            .add_source(config::File::from(PathBuf::from(&path)).required(false))
            .add_source(
                config::Environment::with_prefix("AGENT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path))?;

        config
            .try_deserialize()
            .context("Invalid agent configuration")
    }

    /// Endpoint with the credentials the options describe
    pub fn endpoint(&self) -> Result<EndpointConfig, ConfigError> {
        let section = &self.endpoint;
        let credentials = match (
            &section.username,
            &section.password,
            &section.certificate,
            &section.private_key,
        ) {
            (None, None, None, None) => Credentials::Anonymous,
            (Some(username), Some(password), None, None) => Credentials::UserPassword {
                username: username.clone(),
                password: password.clone(),
            },
            (None, None, Some(certificate), Some(private_key)) => Credentials::Certificate {
                certificate: certificate.clone(),
                private_key: private_key.clone(),
            },
            _ => {
                return Err(ConfigError::InvalidEndpoint {
                    url: section.url.clone(),
                    reason: "credentials need username and password, or certificate and private_key"
                        .to_string(),
                })
            }
        };

        let endpoint = EndpointConfig::new(&section.url).with_credentials(credentials);
        let scheme = endpoint.scheme()?;
        if scheme != "sim" {
            return Err(ConfigError::UnsupportedScheme(scheme));
        }
        Ok(endpoint)
    }

    /// Supervisor configuration; structural errors surface here
    pub fn supervisor(&self) -> Result<SupervisorConfig, ConfigError> {
        let mut config = SupervisorConfig::new(SignalAddress::boolean(&self.watch.node)?);
        config.sampling_interval = Duration::from_millis(self.watch.sampling_interval_ms);
        config.poll_interval = Duration::from_millis(self.supervisor.poll_interval_ms);
        config.retry_backoff = Duration::from_millis(self.supervisor.retry_backoff_ms);
        config.continuity = self.supervisor.continuity;
        config.tracker = self.tracker.clone();
        config.mirror_targets = self.mirror_targets.clone();

        config.dosing = self.dosing.as_ref().map(|d| DosingConfig {
            interlock: SignalAddress::new(d.interlock.clone(), ValueType::Boolean),
            batch_time: Duration::from_millis(d.batch_time_ms),
            min_pause: Duration::from_millis(d.min_pause_ms),
        });

        config.startup_writes = self
            .startup_writes
            .iter()
            .map(|w| StartupWrite {
                address: SignalAddress::new(w.node.clone(), w.value_type),
                value: w.value,
            })
            .collect();

        if let Some(sequence) = &self.sequence {
            config.sequence = Some(SetpointSequence::new(
                sequence.targets.clone(),
                sequence.columns.clone(),
                Duration::from_millis(sequence.step_ms),
            )?);
        }

        config.sampler = self.sampler.as_ref().map(|s| SamplerConfig {
            address: SignalAddress::new(s.node.clone(), s.value_type),
            interval: Duration::from_millis(s.interval_ms),
            log_every: s.log_every,
        });

        config.validate()?;
        Ok(config)
    }

    /// Every address the simulated endpoint has to serve
    pub fn simulated_addresses(&self, supervisor: &SupervisorConfig) -> Vec<SignalAddress> {
        let mut addresses = vec![supervisor.watched.clone()];
        addresses.extend(supervisor.mirror_targets.iter().cloned());
        if let Some(dosing) = &supervisor.dosing {
            addresses.push(dosing.interlock.clone());
        }
        addresses.extend(supervisor.startup_writes.iter().map(|w| w.address.clone()));
        if let Some(sequence) = &supervisor.sequence {
            addresses.extend(sequence.targets().iter().cloned());
        }
        if let Some(sampler) = &supervisor.sampler {
            addresses.push(sampler.address.clone());
        }
        addresses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> AgentConfig {
        config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse("");
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.endpoint.url, "sim://localhost");

        let supervisor = config.supervisor().unwrap();
        assert_eq!(supervisor.poll_interval, Duration::from_secs(1));
        assert_eq!(supervisor.retry_backoff, Duration::from_secs(2));
        assert_eq!(supervisor.continuity, ContinuityPolicy::Reset);
        assert_eq!(supervisor.tracker.reference_flow_rate, 33.0);
        assert!(supervisor.dosing.is_none());
        assert!(matches!(
            config.endpoint().unwrap().credentials,
            Credentials::Anonymous
        ));
    }

    #[test]
    fn test_full_file() {
        let config = parse(
            r#"
            station_name = "mixer-1"

            [endpoint]
            url = "sim://plant"
            username = "operator"
            password = "secret"

            [watch]
            node = "ns=2;s=Tags.GECO/MP_Mixer_Run"

            [tracker]
            reference_flow_rate = 40.0
            window_sizes = [2, 4]
            first_cycle = "discard"

            [supervisor]
            retry_backoff_ms = 500
            continuity = "carry_over"

            [[mirror_targets]]
            node = "ns=4;i=22"
            type = "boolean"

            [[mirror_targets]]
            node = "ns=4;s=|var|ECC2100 0.8S 1131.Application.GVL_OPC.aut_mixer"
            type = "integer"

            [dosing]
            interlock = "ns=2;s=Tags.GECO/MPRX_DI_Mixer_Disabled"

            [[startup_writes]]
            node = "ns=2;s=Tags.GECO/MPRX_DI_Wetprobe_Upper_Cov_Delay_s_I"
            type = "integer"
            value = 1

            [sequence]
            step_ms = 1000
            columns = [[0, 50, 100]]

            [[sequence.targets]]
            node = "ns=4;i=78"
            type = "float"

            [sampler]
            node = "ns=1;i=104"
            type = "float"
            interval_ms = 250
            "#,
        );

        assert_eq!(config.station_name, "mixer-1");
        assert!(matches!(
            config.endpoint().unwrap().credentials,
            Credentials::UserPassword { .. }
        ));

        let supervisor = config.supervisor().unwrap();
        assert_eq!(supervisor.tracker.window_sizes, vec![2, 4]);
        assert_eq!(supervisor.continuity, ContinuityPolicy::CarryOver);
        assert_eq!(supervisor.retry_backoff, Duration::from_millis(500));
        assert_eq!(supervisor.mirror_targets.len(), 2);
        assert_eq!(supervisor.mirror_targets[1].value_type, ValueType::Integer);
        assert_eq!(supervisor.dosing.as_ref().unwrap().batch_time, Duration::from_secs(5));
        assert_eq!(supervisor.startup_writes[0].value, SignalValue::Int(1));
        assert_eq!(supervisor.sequence.as_ref().unwrap().steps(), 3);
        assert_eq!(supervisor.sampler.as_ref().unwrap().interval, Duration::from_millis(250));

        // watched, 2 mirrors, interlock, startup write, sequence target, sampler
        assert_eq!(config.simulated_addresses(&supervisor).len(), 7);
    }

    #[test]
    fn test_unsupported_scheme() {
        let config = parse(
            r#"
            [endpoint]
            url = "opc.tcp://10.129.4.80:48010"
            "#,
        );
        assert!(matches!(
            config.endpoint(),
            Err(ConfigError::UnsupportedScheme(scheme)) if scheme == "opc.tcp"
        ));
    }

    #[test]
    fn test_partial_credentials_rejected() {
        let config = parse(
            r#"
            [endpoint]
            username = "operator"
            "#,
        );
        tokio_test::assert_err!(config.endpoint());
    }

    #[test]
    fn test_mismatched_sequence_is_fatal() {
        let config = parse(
            r#"
            [sequence]
            step_ms = 1000
            columns = [[1.0, 2.0], [1.0]]

            [[sequence.targets]]
            node = "ns=4;i=78"
            type = "float"

            [[sequence.targets]]
            node = "ns=4;i=79"
            type = "float"
            "#,
        );
        assert!(matches!(
            config.supervisor(),
            Err(ConfigError::SequenceLengthMismatch { .. })
        ));
    }

    #[test]
    fn test_malformed_watched_address() {
        let config = parse(
            r#"
            [watch]
            node = "Tags.GECO/MP_Mixer_Run"
            "#,
        );
        assert!(matches!(
            config.supervisor(),
            Err(ConfigError::InvalidAddress { .. })
        ));
    }
}
