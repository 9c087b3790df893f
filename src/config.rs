//! Service configuration from environment variables
//!
//! Every setting has a default; `.env` files are honoured by the binaries.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::canonical::Canonicalizer;
use crate::error::PipelineError;
use crate::ledger::{LedgerConfig, RolloverPolicy};
use crate::stream::StreamConfig;
use crate::telemetry::bus::DEFAULT_SUBSCRIBER_CAPACITY;
use crate::telemetry::{AuditPolicy, FailureMode};
use crate::Result;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub ledger_dir: PathBuf,
    pub ledger: LedgerConfig,
    pub subscriber_capacity: usize,
    pub stream: StreamConfig,
    pub audit_policy: AuditPolicy,
    pub database_url: Option<String>,
    pub specialist_api_base_url: Option<String>,
    pub specialist_agents: Vec<String>,
    pub agent_request_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            ledger_dir: PathBuf::from("./ledger"),
            ledger: LedgerConfig::default(),
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            stream: StreamConfig::default(),
            audit_policy: AuditPolicy::default(),
            database_url: None,
            specialist_api_base_url: None,
            specialist_agents: Vec::new(),
            agent_request_timeout: Duration::from_secs(30),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = match get("PORT").or_else(|| get("API_PORT")) {
            Some(value) => parse("PORT", &value)?,
            None => defaults.port,
        };

        let monetary_fields = get("MONETARY_FIELDS");
        let canonicalizer = match &monetary_fields {
            Some(list) => Canonicalizer::with_monetary_fields(split_list(list)),
            None => Canonicalizer::new(),
        };

        let ledger = LedgerConfig {
            write_attempts: parse_or(&get, "LEDGER_WRITE_ATTEMPTS", defaults.ledger.write_attempts)?,
            retry_base: Duration::from_millis(parse_or(
                &get,
                "LEDGER_RETRY_BASE_MS",
                defaults.ledger.retry_base.as_millis() as u64,
            )?),
            rollover: RolloverPolicy {
                max_entries: parse_opt(&get, "EPOCH_MAX_ENTRIES")?,
                max_age: parse_opt::<u64, _>(&get, "EPOCH_MAX_AGE_SECS")?.map(Duration::from_secs),
            },
            canonicalizer,
        };

        let stream = StreamConfig {
            step_timeout: Duration::from_millis(parse_or(
                &get,
                "STEP_TIMEOUT_MS",
                defaults.stream.step_timeout.as_millis() as u64,
            )?),
            channel_capacity: defaults.stream.channel_capacity,
            retry_after_ms: parse_or(&get, "ERROR_RETRY_AFTER_MS", defaults.stream.retry_after_ms)?,
        };

        let audit_policy = AuditPolicy {
            trade_execution: parse_or::<FailureMode, _>(
                &get,
                "AUDIT_POLICY_TRADE",
                defaults.audit_policy.trade_execution,
            )?,
            informational: parse_or::<FailureMode, _>(
                &get,
                "AUDIT_POLICY_INFO",
                defaults.audit_policy.informational,
            )?,
        };

        Ok(Self {
            port,
            ledger_dir: get("LEDGER_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.ledger_dir),
            ledger,
            subscriber_capacity: parse_or(&get, "SUBSCRIBER_CAPACITY", defaults.subscriber_capacity)?,
            stream,
            audit_policy,
            database_url: get("POSTGRES_URL").or_else(|| get("DATABASE_URL")),
            specialist_api_base_url: get("SPECIALIST_API_BASE_URL"),
            specialist_agents: get("SPECIALIST_AGENTS")
                .map(|list| split_list(&list))
                .unwrap_or_default(),
            agent_request_timeout: Duration::from_millis(parse_or(
                &get,
                "AGENT_REQUEST_TIMEOUT_MS",
                defaults.agent_request_timeout.as_millis() as u64,
            )?),
        })
    }
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| PipelineError::Config(format!("{}={:?}: {}", key, value, e)))
}

fn parse_opt<T, G>(get: &G, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    get(key).map(|value| parse(key, &value)).transpose()
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    Ok(parse_opt(get, key)?.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<AppConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.ledger_dir, PathBuf::from("./ledger"));
        assert_eq!(config.ledger.write_attempts, 3);
        assert_eq!(config.stream.step_timeout, Duration::from_secs(15));
        assert_eq!(config.audit_policy, AuditPolicy::default());
        assert!(config.database_url.is_none());
        assert!(config.ledger.rollover.max_entries.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("API_PORT", "9090"),
            ("STEP_TIMEOUT_MS", "500"),
            ("EPOCH_MAX_ENTRIES", "1000"),
            ("AUDIT_POLICY_INFO", "block"),
            ("SPECIALIST_AGENTS", "quant_agent, risk_agent,"),
            ("MONETARY_FIELDS", "notional"),
        ])
        .unwrap();

        assert_eq!(config.port, 9090);
        assert_eq!(config.stream.step_timeout, Duration::from_millis(500));
        assert_eq!(config.ledger.rollover.max_entries, Some(1000));
        assert_eq!(config.audit_policy.informational, FailureMode::Block);
        assert_eq!(config.specialist_agents, vec!["quant_agent", "risk_agent"]);
        assert_eq!(
            config.ledger.canonicalizer.monetary_fields().collect::<Vec<_>>(),
            vec!["notional"]
        );
    }

    #[test]
    fn test_port_prefers_port_over_api_port() {
        let config = config(&[("PORT", "7000"), ("API_PORT", "9090")]).unwrap();
        assert_eq!(config.port, 7000);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            config(&[("LEDGER_WRITE_ATTEMPTS", "many")]),
            Err(PipelineError::Config(_))
        ));
        assert!(matches!(
            config(&[("AUDIT_POLICY_TRADE", "ignore")]),
            Err(PipelineError::Config(_))
        ));
    }
}
