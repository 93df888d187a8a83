use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TICK_SECS: u64 = 60;
pub const DEFAULT_SMTP_PORT: u16 = 25;
pub const DEFAULT_MAIL_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_LEASE_SECS: u64 = 3600;

/// Top-level config (propdesk.toml + PROPDESK_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PropdeskConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub mail: MailConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Task scheduler settings used by the `serve` loop and the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between two sweeps in `serve` mode.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Upper bound on a single handler invocation. `None` waits forever.
    #[serde(default)]
    pub handler_timeout_secs: Option<u64>,
    /// Seed the default task catalog before the first tick.
    #[serde(default = "bool_true")]
    pub bootstrap_on_start: bool,
    /// Age after which an execution lease left behind by a crashed process
    /// may be taken over.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: DEFAULT_TICK_SECS,
            handler_timeout_secs: None,
            bootstrap_on_start: true,
            lease_secs: DEFAULT_LEASE_SECS,
        }
    }
}

/// Outgoing mail relay probed by the `TEST_EMAIL_CONFIG` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default = "default_helo_name")]
    pub helo_name: String,
    #[serde(default = "default_mail_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            smtp_host: default_smtp_host(),
            smtp_port: DEFAULT_SMTP_PORT,
            helo_name: default_helo_name(),
            timeout_secs: DEFAULT_MAIL_TIMEOUT_SECS,
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_tick_secs() -> u64 {
    DEFAULT_TICK_SECS
}
fn default_lease_secs() -> u64 {
    DEFAULT_LEASE_SECS
}
fn default_smtp_host() -> String {
    "localhost".to_string()
}
fn default_smtp_port() -> u16 {
    DEFAULT_SMTP_PORT
}
fn default_helo_name() -> String {
    "propdesk.local".to_string()
}
fn default_mail_timeout_secs() -> u64 {
    DEFAULT_MAIL_TIMEOUT_SECS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.propdesk/propdesk.db", home)
}

impl PropdeskConfig {
    /// Load config from a TOML file with PROPDESK_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.propdesk/propdesk.toml
    ///
    /// A missing file is not an error; every section has defaults.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::figment(&path)
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))
    }

    fn figment(path: &str) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("PROPDESK_").split("__"))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.propdesk/propdesk.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = PropdeskConfig::load(Some("/nonexistent/propdesk.toml")).expect("load");
        assert_eq!(cfg.scheduler.tick_secs, DEFAULT_TICK_SECS);
        assert!(cfg.scheduler.handler_timeout_secs.is_none());
        assert!(cfg.scheduler.bootstrap_on_start);
        assert_eq!(cfg.scheduler.lease_secs, DEFAULT_LEASE_SECS);
        assert_eq!(cfg.mail.smtp_port, DEFAULT_SMTP_PORT);
    }

    #[test]
    fn toml_overrides_scheduler_section() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "propdesk.toml",
                r#"
                [scheduler]
                tick_secs = 5
                handler_timeout_secs = 30

                [mail]
                smtp_host = "mail.example.org"
                smtp_port = 587
                "#,
            )?;
            let cfg = PropdeskConfig::load(Some("propdesk.toml")).expect("load");
            assert_eq!(cfg.scheduler.tick_secs, 5);
            assert_eq!(cfg.scheduler.handler_timeout_secs, Some(30));
            assert_eq!(cfg.mail.smtp_host, "mail.example.org");
            assert_eq!(cfg.mail.smtp_port, 587);
            Ok(())
        });
    }

    #[test]
    fn env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("propdesk.toml", "[scheduler]\ntick_secs = 5\n")?;
            jail.set_env("PROPDESK_SCHEDULER__TICK_SECS", "15");
            let cfg = PropdeskConfig::load(Some("propdesk.toml")).expect("load");
            assert_eq!(cfg.scheduler.tick_secs, 15);
            Ok(())
        });
    }
}
