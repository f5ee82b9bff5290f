use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::session::{CachePolicy, ConfigurationManager, CookieAcceptPolicy, SessionClass};

const ENV_PREFIX: &str = "SKEIN_";

/// On-disk form of the session settings.
///
/// Every field is optional; absent fields keep the manager defaults.
/// Timeouts are written in (fractional) seconds.
///
/// ```toml
/// session_class = "ephemeral"
/// request_timeout_secs = 15
///
/// [headers]
/// User-Agent = "skein"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub session_class: Option<SessionClass>,
    pub headers: BTreeMap<String, String>,
    pub discretionary: Option<bool>,
    pub sends_launch_events: Option<bool>,
    pub resource_timeout_secs: Option<f64>,
    pub request_timeout_secs: Option<f64>,
    pub should_send_cookies: Option<bool>,
    pub cookie_accept_policy: Option<CookieAcceptPolicy>,
    pub cache_policy: Option<CachePolicy>,
}

impl ConfigFile {
    /// Read `path` and overlay `SKEIN_*` environment variables on top.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let fig = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX));
        Ok(fig.extract()?)
    }

    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(Figment::new().merge(Toml::string(source)).extract()?)
    }

    /// Apply every present field to `manager`.
    pub fn apply(self, manager: &mut ConfigurationManager) -> Result<(), ConfigError> {
        if let Some(class) = self.session_class {
            manager.set_session_class(class);
        }
        manager.append_http_additional_headers(self.headers);
        if let Some(discretionary) = self.discretionary {
            manager.set_discretionary(discretionary);
        }
        if let Some(sends) = self.sends_launch_events {
            manager.set_sends_launch_events(sends);
        }
        if let Some(secs) = self.resource_timeout_secs {
            manager.set_resource_timeout(seconds("resource_timeout_secs", secs)?);
        }
        if let Some(secs) = self.request_timeout_secs {
            manager.set_request_timeout(seconds("request_timeout_secs", secs)?);
        }
        if let Some(send) = self.should_send_cookies {
            manager.set_should_send_cookies(send);
        }
        if let Some(policy) = self.cookie_accept_policy {
            manager.set_cookie_accept_policy(policy);
        }
        if let Some(policy) = self.cache_policy {
            manager.set_cache_policy(policy);
        }
        Ok(())
    }
}

fn seconds(field: &'static str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::InvalidTimeout { field, value })
}

impl ConfigurationManager {
    /// Build a manager from defaults overlaid with a config file and the environment.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut manager = Self::default();
        ConfigFile::load(path)?.apply(&mut manager)?;
        Ok(manager)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_from_toml_str() {
        let file = ConfigFile::from_toml_str(
            r#"
            session_class = { background = "nightly" }
            request_timeout_secs = 2.5
            cookie_accept_policy = "never"

            [headers]
            Accept = "application/json"
            "#,
        )
        .unwrap();

        assert_eq!(file.session_class, Some(SessionClass::Background("nightly".into())));
        assert_eq!(file.request_timeout_secs, Some(2.5));
        assert_eq!(file.cookie_accept_policy, Some(CookieAcceptPolicy::Never));
        assert_eq!(file.headers.get("Accept").map(String::as_str), Some("application/json"));
        assert_eq!(file.cache_policy, None);
    }

    #[test]
    fn test_apply_keeps_defaults_for_absent_fields() {
        let mut manager = ConfigurationManager::new();
        ConfigFile::from_toml_str("request_timeout_secs = 5")
            .unwrap()
            .apply(&mut manager)
            .unwrap();

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.request_timeout(), Duration::from_secs(5));
        assert_eq!(snapshot.resource_timeout(), Duration::from_secs(604_800));
        assert!(snapshot.should_send_cookies());
    }

    #[test]
    fn test_negative_timeout_rejected() {
        let mut manager = ConfigurationManager::new();
        let err = ConfigFile::from_toml_str("resource_timeout_secs = -1.0")
            .unwrap()
            .apply(&mut manager)
            .unwrap_err();

        assert!(matches!(
            err,
            ConfigError::InvalidTimeout { field: "resource_timeout_secs", .. }
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "cache_policy = \"return_cache_data_else_load\"").unwrap();
        writeln!(tmp, "should_send_cookies = false").unwrap();

        let manager = ConfigurationManager::load(tmp.path()).unwrap();
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.cache_policy(), CachePolicy::ReturnCacheDataElseLoad);
        assert!(!snapshot.should_send_cookies());
    }

    #[test]
    fn test_serialized_file_reloads() {
        let file = ConfigFile {
            session_class: Some(SessionClass::Ephemeral),
            headers: [("X-Trace".to_string(), "on".to_string())].into(),
            request_timeout_secs: Some(30.0),
            ..ConfigFile::default()
        };

        let text = toml::to_string(&file).unwrap();
        assert_eq!(ConfigFile::from_toml_str(&text).unwrap(), file);
    }
}
