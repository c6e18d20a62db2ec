use anyhow::{anyhow, Context};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SUPER_ADMIN_EMAIL: &str = "admin@aurora-school.local";
pub const DEFAULT_SCHOOL_NAME: &str = "Aurora School";
pub const DEFAULT_EMAILJS_ENDPOINT: &str = "https://api.emailjs.com/api/v1.0/email/send";

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "snake_case")]
pub struct Config {
    /// Workspace opened at start-up. The UI can still switch with `workspace.select`.
    pub workspace: Option<PathBuf>,
    pub super_admin_email: String,
    pub school_name: String,
    pub mailer: MailerConfig,
    pub notify: NotifyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            workspace: None,
            super_admin_email: DEFAULT_SUPER_ADMIN_EMAIL.to_string(),
            school_name: DEFAULT_SCHOOL_NAME.to_string(),
            mailer: MailerConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MailerConfig {
    #[default]
    Disabled,
    DropDir {
        dir: PathBuf,
    },
    Emailjs {
        service_id: String,
        template_id: String,
        user_id: String,
        #[serde(default = "default_emailjs_endpoint")]
        endpoint: String,
    },
}

fn default_emailjs_endpoint() -> String {
    DEFAULT_EMAILJS_ENDPOINT.to_string()
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "snake_case")]
pub struct NotifyConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub poll_ms: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        NotifyConfig {
            max_attempts: 4,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            poll_ms: 1_000,
        }
    }
}

impl NotifyConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms.max(10))
    }
}

impl Config {
    /// Reads `$AURORAD_CONFIG` (if set) and then applies `AURORAD_*` overrides.
    pub fn load() -> anyhow::Result<Config> {
        Self::load_from(|key| std::env::var(key).ok())
    }

    pub fn load_from<F>(env: F) -> anyhow::Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = match env("AURORAD_CONFIG") {
            Some(path) if !path.trim().is_empty() => Self::from_file(Path::new(path.trim()))?,
            _ => Config::default(),
        };
        cfg.apply_env(&env)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Config> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.to_string_lossy()))?;
        toml::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.to_string_lossy()))
    }

    fn apply_env<F>(&mut self, env: &F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("AURORAD_WORKSPACE") {
            self.workspace = Some(PathBuf::from(v));
        }
        if let Some(v) = get("AURORAD_SUPER_ADMIN_EMAIL") {
            self.super_admin_email = v;
        }
        if let Some(v) = get("AURORAD_SCHOOL_NAME") {
            self.school_name = v;
        }

        match get("AURORAD_MAILER").as_deref() {
            None => {}
            Some("disabled") => self.mailer = MailerConfig::Disabled,
            Some("drop_dir") => {
                let dir = get("AURORAD_MAIL_DROP_DIR")
                    .ok_or_else(|| anyhow!("AURORAD_MAILER=drop_dir requires AURORAD_MAIL_DROP_DIR"))?;
                self.mailer = MailerConfig::DropDir {
                    dir: PathBuf::from(dir),
                };
            }
            Some("emailjs") => {
                let need = |key: &str| {
                    get(key).ok_or_else(|| anyhow!("AURORAD_MAILER=emailjs requires {}", key))
                };
                self.mailer = MailerConfig::Emailjs {
                    service_id: need("AURORAD_EMAILJS_SERVICE_ID")?,
                    template_id: need("AURORAD_EMAILJS_TEMPLATE_ID")?,
                    user_id: need("AURORAD_EMAILJS_USER_ID")?,
                    endpoint: get("AURORAD_EMAILJS_ENDPOINT")
                        .unwrap_or_else(default_emailjs_endpoint),
                };
            }
            Some(other) => {
                return Err(anyhow!(
                    "AURORAD_MAILER must be one of: disabled, drop_dir, emailjs (got {})",
                    other
                ))
            }
        }

        if let Some(v) = get("AURORAD_NOTIFY_MAX_ATTEMPTS") {
            self.notify.max_attempts = v
                .parse()
                .with_context(|| format!("AURORAD_NOTIFY_MAX_ATTEMPTS: {}", v))?;
        }
        if let Some(v) = get("AURORAD_NOTIFY_BASE_DELAY_MS") {
            self.notify.base_delay_ms = v
                .parse()
                .with_context(|| format!("AURORAD_NOTIFY_BASE_DELAY_MS: {}", v))?;
        }
        if let Some(v) = get("AURORAD_NOTIFY_MAX_DELAY_MS") {
            self.notify.max_delay_ms = v
                .parse()
                .with_context(|| format!("AURORAD_NOTIFY_MAX_DELAY_MS: {}", v))?;
        }
        if let Some(v) = get("AURORAD_NOTIFY_POLL_MS") {
            self.notify.poll_ms = v
                .parse()
                .with_context(|| format!("AURORAD_NOTIFY_POLL_MS: {}", v))?;
        }
        Ok(())
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.super_admin_email.trim().is_empty() {
            return Err(anyhow!("super_admin_email must not be empty"));
        }
        if self.notify.max_attempts == 0 {
            return Err(anyhow!("notify.max_attempts must be at least 1"));
        }
        if self.notify.max_delay_ms < self.notify.base_delay_ms {
            return Err(anyhow!("notify.max_delay_ms must be >= notify.base_delay_ms"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let cfg = Config::load_from(env_of(&[])).expect("load");
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.mailer, MailerConfig::Disabled);
    }

    #[test]
    fn env_selects_drop_dir_mailer_and_retry_policy() {
        let cfg = Config::load_from(env_of(&[
            ("AURORAD_MAILER", "drop_dir"),
            ("AURORAD_MAIL_DROP_DIR", "/tmp/outbox"),
            ("AURORAD_NOTIFY_MAX_ATTEMPTS", "2"),
            ("AURORAD_SUPER_ADMIN_EMAIL", "head@school.test"),
        ]))
        .expect("load");
        assert_eq!(
            cfg.mailer,
            MailerConfig::DropDir {
                dir: PathBuf::from("/tmp/outbox")
            }
        );
        assert_eq!(cfg.notify.max_attempts, 2);
        assert_eq!(cfg.super_admin_email, "head@school.test");
    }

    #[test]
    fn emailjs_requires_all_keys() {
        let res = Config::load_from(env_of(&[
            ("AURORAD_MAILER", "emailjs"),
            ("AURORAD_EMAILJS_SERVICE_ID", "svc"),
        ]));
        assert!(res.is_err());
    }

    #[test]
    fn rejects_unknown_mailer_and_zero_attempts() {
        assert!(Config::load_from(env_of(&[("AURORAD_MAILER", "smtp")])).is_err());
        assert!(Config::load_from(env_of(&[("AURORAD_NOTIFY_MAX_ATTEMPTS", "0")])).is_err());
    }

    #[test]
    fn parses_toml_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("aurorad.toml");
        std::fs::write(
            &path,
            r#"
school_name = "Escola Modelo"

[mailer]
kind = "emailjs"
service_id = "svc"
template_id = "tpl"
user_id = "usr"

[notify]
max_attempts = 3
"#,
        )
        .expect("write config");
        let cfg = Config::load_from(env_of(&[(
            "AURORAD_CONFIG",
            path.to_str().expect("utf8 path"),
        )]))
        .expect("load");
        assert_eq!(cfg.school_name, "Escola Modelo");
        assert_eq!(cfg.notify.max_attempts, 3);
        assert_eq!(cfg.notify.base_delay_ms, 2_000);
        match cfg.mailer {
            MailerConfig::Emailjs { endpoint, .. } => {
                assert_eq!(endpoint, DEFAULT_EMAILJS_ENDPOINT)
            }
            other => panic!("unexpected mailer {:?}", other),
        }
    }
}
