use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use url::Url;

use crate::signals::SignalSpec;

static PREFIX: &str = "throttle";

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub host: String,
    pub port: u16,

    /// Base URL every admitted request is forwarded to.
    pub upstream_url: String,

    pub human_logs: bool,

    pub statsd_host: Option<String>,
    pub statsd_port: u16,
    pub statsd_label: String,

    pub actix_keep_alive: Option<u32>,

    /// Optional per-request deadline, applied by the server form before a
    /// request enters the chain.
    pub client_timeout_ms: Option<u64>,

    pub middleware: MiddlewareSettings,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MiddlewareSettings {
    pub enable_observer: bool,

    pub enable_blocker: bool,
    /// `HEADER=REGEX` pairs, compiled when the blocker is constructed.
    pub block_patterns: Vec<String>,

    pub enable_jitter: bool,
    pub jitter_delay_ms: u64,
    pub enable_criticality: bool,

    pub enable_backpressure: bool,
    pub backpressure: BackpressureSettings,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BackpressureSettings {
    /// Metrics endpoint the signal pollers query.
    pub monitoring_base_url: String,

    /// Congestion window bounds; the watermark always stays inside them.
    pub window_min: usize,
    pub window_max: usize,

    /// Let recent-data queries skip admission entirely.
    pub enable_low_cost_bypass: bool,

    pub signals: Vec<SignalSpec>,
}

impl Settings {
    /// Load the settings from the config file if supplied, then the environment.
    pub fn with_env_and_config_file(filename: Option<&str>) -> Result<Self, ConfigError> {
        let mut s = Config::default();

        // Merge the config file if supplied
        if let Some(config_filename) = filename {
            s.merge(File::with_name(config_filename))?;
        }

        // Merge the environment overrides
        // While the prefix is currently case insensitive, it's traditional that
        // environment vars be UPPERCASE, this ensures that will continue should
        // Environment ever change their policy about case insensitivity.
        // This will accept environment variables specified as
        // `THROTTLE_FOO__BAR_VALUE="gorp"` as `foo.bar_value = "gorp"`
        s.merge(Environment::with_prefix(&PREFIX.to_uppercase()).separator("__"))?;

        match s.try_into::<Self>() {
            Ok(s) => {
                s.validate()?;
                Ok(s)
            }
            // Configuration errors are not very sysop friendly, Try to make them
            // a bit more 3AM useful.
            Err(ConfigError::Message(v)) => {
                println!("Bad configuration: {:?}", &v);
                println!("Please set in config file or use environment variable.");
                println!(
                    "For example to set `upstream_url` use env var `{}_UPSTREAM_URL`\n",
                    PREFIX.to_uppercase()
                );
                error!("Configuration error: Value undefined {:?}", &v);
                Err(ConfigError::NotFound(v))
            }
            Err(e) => {
                error!("Configuration error: Other: {:?}", &e);
                Err(e)
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_base_url(&self.upstream_url, "upstream_url")?;

        let middleware = &self.middleware;
        if middleware.enable_backpressure {
            let backpressure = &middleware.backpressure;
            check_base_url(&backpressure.monitoring_base_url, "monitoring_base_url")?;
            if backpressure.window_min < 1 {
                return Err(ConfigError::Message(
                    "window_min must be at least 1".to_owned(),
                ));
            }
            if backpressure.window_min > backpressure.window_max {
                return Err(ConfigError::Message(format!(
                    "window_min {} exceeds window_max {}",
                    backpressure.window_min, backpressure.window_max
                )));
            }
            if backpressure.signals.is_empty() {
                return Err(ConfigError::Message(
                    "backpressure requires at least one signal".to_owned(),
                ));
            }
            for signal in &backpressure.signals {
                signal.validate().map_err(ConfigError::Message)?;
            }
        }

        Ok(())
    }

    pub fn banner(&self) -> String {
        format!(
            "http://{}:{} -> {}",
            self.host, self.port, self.upstream_url
        )
    }

    #[cfg(test)]
    pub fn test_settings() -> Self {
        let mut settings =
            Self::with_env_and_config_file(None).expect("Could not get Settings in test_settings");
        settings.port = 8000;
        settings.statsd_host = None;
        settings
    }
}

fn check_base_url(value: &str, name: &str) -> Result<(), ConfigError> {
    let url = Url::parse(value)
        .map_err(|e| ConfigError::Message(format!("invalid {} {:?}: {}", name, value, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::Message(format!(
            "{} must be http or https, got {:?}",
            name, value
        )));
    }
    Ok(())
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            host: "127.0.0.1".to_string(),
            port: 8000,
            upstream_url: "http://127.0.0.1:9090".to_owned(),
            human_logs: false,
            statsd_host: Some("localhost".to_owned()),
            statsd_port: 8125,
            statsd_label: "throttleproxy".to_owned(),
            actix_keep_alive: None,
            client_timeout_ms: None,
            middleware: MiddlewareSettings::default(),
        }
    }
}

impl Default for MiddlewareSettings {
    fn default() -> MiddlewareSettings {
        MiddlewareSettings {
            enable_observer: true,
            enable_blocker: false,
            block_patterns: vec![],
            enable_jitter: false,
            jitter_delay_ms: 100,
            enable_criticality: false,
            enable_backpressure: false,
            backpressure: BackpressureSettings::default(),
        }
    }
}

impl Default for BackpressureSettings {
    fn default() -> BackpressureSettings {
        BackpressureSettings {
            monitoring_base_url: "http://127.0.0.1:9090".to_owned(),
            window_min: 1,
            window_max: 100,
            enable_low_cost_bypass: false,
            signals: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use std::env;

    use super::*;

    #[test]
    fn test_environment_variable_prefix() {
        env::set_var("THROTTLE_MIDDLEWARE__ENABLE_JITTER", "true");
        let settings = Settings::with_env_and_config_file(None).unwrap();
        assert!(settings.middleware.enable_jitter);

        // An incorrect prefix does not set the setting
        env::remove_var("THROTTLE_MIDDLEWARE__ENABLE_JITTER");
        env::set_var("THROTTLEX_MIDDLEWARE__ENABLE_JITTER", "true");
        let settings = Settings::with_env_and_config_file(None).unwrap();
        assert!(!settings.middleware.enable_jitter);
        env::remove_var("THROTTLEX_MIDDLEWARE__ENABLE_JITTER");
    }

    #[test]
    fn test_backpressure_validation() {
        let mut settings = Settings::default();
        settings.middleware.enable_backpressure = true;

        // No signals configured
        assert!(settings.validate().is_err());

        settings.middleware.backpressure.signals = vec![SignalSpec {
            query: "sum(rate(http_requests_total[5m]))".to_owned(),
            name: Some("request_rate".to_owned()),
            warn: 10.0,
            emergency: 100.0,
            curve: 4.0,
        }];
        settings.validate().unwrap();

        settings.middleware.backpressure.window_min = 0;
        assert!(settings.validate().is_err());

        settings.middleware.backpressure.window_min = 50;
        settings.middleware.backpressure.window_max = 10;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rejects_non_http_urls() {
        let settings = Settings {
            upstream_url: "ftp://example.com".to_owned(),
            ..Settings::default()
        };
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.middleware.enable_backpressure = true;
        settings.middleware.backpressure.monitoring_base_url = "not a url".to_owned();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_signal_bounds_validation() {
        let mut settings = Settings::default();
        settings.middleware.enable_backpressure = true;
        settings.middleware.backpressure.signals = vec![SignalSpec {
            query: "up".to_owned(),
            name: None,
            warn: 100.0,
            emergency: 10.0,
            curve: 4.0,
        }];
        // emergency must exceed warn
        assert!(settings.validate().is_err());
    }
}
