use std::str::FromStr;
use std::time;

use alert_common::retry::RetryPolicy;
use envconfig::Envconfig;
use url::Url;

use crate::reader::AuthScheme;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    pub device_host: NonEmptyString,

    #[envconfig(default = "false")]
    pub device_https: bool,

    #[envconfig(default = "false")]
    pub device_insecure_tls: bool,

    #[envconfig(default = "/ISAPI/Event/notification/alertStream")]
    pub alert_stream_path: String,

    #[envconfig(default = "admin")]
    pub device_username: String,

    #[envconfig(default = "")]
    pub device_password: String,

    #[envconfig(default = "digest")]
    pub auth_scheme: AuthScheme,

    #[envconfig(default = "5000")]
    pub connect_timeout: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub read_idle_timeout: EnvMsDuration,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,

    #[envconfig(default = "5000")]
    pub dedup_quiet_window: EnvMsDuration,

    #[envconfig(default = "1024")]
    pub dedup_max_entries: usize,

    #[envconfig(default = "65536")]
    pub max_frame_size: usize,

    #[envconfig(default = "5000")]
    pub sink_timeout: EnvMsDuration,

    #[envconfig(default = "1024")]
    pub dispatch_queue_capacity: usize,

    #[envconfig(default = "5000")]
    pub shutdown_grace_period: EnvMsDuration,

    #[envconfig(default = "false")]
    pub forward_inactive_events: bool,

    #[envconfig(default = "true")]
    pub log_sink: bool,

    pub webhook_url: Option<NonEmptyString>,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Full URL of the device's alert stream.
    pub fn device_endpoint(&self) -> Result<Url, url::ParseError> {
        let scheme = if self.device_https { "https" } else { "http" };
        let base = Url::parse(&format!("{}://{}", scheme, self.device_host.as_str()))?;
        base.join(&self.alert_stream_path)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_policy.backoff_coefficient,
            self.retry_policy.initial_interval.0,
            self.retry_policy.maximum_interval.0,
        )
        .with_jitter(self.retry_policy.jitter)
    }

    /// How long the supervisor may go without reporting before liveness fails.
    ///
    /// The longest quiet stretch is a backoff sleep followed by a two round trip handshake, or
    /// an idle read.
    pub fn liveness_deadline(&self) -> time::Duration {
        let handshake = self.connect_timeout.0 * 2;
        let longest_wait = std::cmp::max(
            self.read_idle_timeout.0,
            self.retry_policy.maximum_interval.0 + handshake,
        );
        longest_wait + time::Duration::from_secs(10)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(default = "1000")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(default = "60000")]
    pub maximum_interval: EnvMsDuration,

    #[envconfig(default = "0.2")]
    pub jitter: f64,
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}
