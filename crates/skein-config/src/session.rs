use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Kind of transport session to build.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionClass {
    /// Persistent session with the shared cookie and credential stores.
    #[default]
    Default,
    /// Session that keeps nothing beyond its own lifetime.
    Ephemeral,
    /// Session whose transfers may continue out of process, keyed by identifier.
    Background(String),
}

impl fmt::Display for SessionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionClass::Default => write!(f, "default"),
            SessionClass::Ephemeral => write!(f, "ephemeral"),
            SessionClass::Background(identifier) => write!(f, "background({identifier})"),
        }
    }
}

/// When cookies offered by a server are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CookieAcceptPolicy {
    Always,
    Never,
    #[default]
    OnlyFromMainDocumentDomain,
}

/// When a cached response may be returned instead of loading from the origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    #[default]
    UseProtocolCachePolicy,
    ReloadIgnoringLocalCacheData,
    ReturnCacheDataElseLoad,
    ReturnCacheDataDontLoad,
}

impl CachePolicy {
    /// `Cache-Control` value a transport without its own cache should send.
    pub fn cache_control(self) -> Option<&'static str> {
        match self {
            CachePolicy::UseProtocolCachePolicy => None,
            CachePolicy::ReloadIgnoringLocalCacheData => Some("no-cache"),
            CachePolicy::ReturnCacheDataElseLoad => Some("max-stale"),
            CachePolicy::ReturnCacheDataDontLoad => Some("only-if-cached"),
        }
    }
}

/// Mutable, session-wide settings.
///
/// Every orchestrator owns one manager. The transport session is built from a
/// fresh [`ConfigurationSnapshot`] each time it is lazily instantiated, so
/// setters only affect sessions created afterwards.
#[derive(Debug, Clone)]
pub struct ConfigurationManager {
    session_class: SessionClass,
    additional_headers: BTreeMap<String, String>,
    discretionary: bool,
    sends_launch_events: bool,
    resource_timeout: Duration,
    request_timeout: Duration,
    should_send_cookies: bool,
    cookie_accept_policy: CookieAcceptPolicy,
    cache_policy: CachePolicy,
}

impl Default for ConfigurationManager {
    fn default() -> Self {
        Self {
            session_class: SessionClass::Default,
            additional_headers: BTreeMap::new(),
            discretionary: false,
            sends_launch_events: true,
            resource_timeout: Duration::from_secs(604_800),
            request_timeout: Duration::from_secs(60),
            should_send_cookies: true,
            cookie_accept_policy: CookieAcceptPolicy::OnlyFromMainDocumentDomain,
            cache_policy: CachePolicy::UseProtocolCachePolicy,
        }
    }
}

impl ConfigurationManager {
    pub fn new() -> Self { Self::default() }

    pub fn set_session_class(&mut self, class: SessionClass) { self.session_class = class; }

    /// Merge headers into the session-wide set, the newest value winning per key.
    pub fn append_http_additional_headers<I, K, V>(&mut self, headers: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.additional_headers
            .extend(headers.into_iter().map(|(k, v)| (k.into(), v.into())));
    }

    pub fn set_discretionary(&mut self, discretionary: bool) { self.discretionary = discretionary; }

    pub fn set_sends_launch_events(&mut self, sends: bool) { self.sends_launch_events = sends; }

    pub fn set_resource_timeout(&mut self, timeout: Duration) { self.resource_timeout = timeout; }

    pub fn set_request_timeout(&mut self, timeout: Duration) { self.request_timeout = timeout; }

    pub fn set_should_send_cookies(&mut self, send: bool) { self.should_send_cookies = send; }

    pub fn set_cookie_accept_policy(&mut self, policy: CookieAcceptPolicy) {
        self.cookie_accept_policy = policy;
    }

    pub fn set_cache_policy(&mut self, policy: CachePolicy) { self.cache_policy = policy; }

    pub fn request_timeout(&self) -> Duration { self.request_timeout }

    /// Build an immutable snapshot of the current settings.
    pub fn snapshot(&self) -> ConfigurationSnapshot {
        let background = matches!(self.session_class, SessionClass::Background(_));
        ConfigurationSnapshot {
            session_class: self.session_class.clone(),
            additional_headers: self.additional_headers.clone(),
            discretionary: background && self.discretionary,
            sends_launch_events: !background || self.sends_launch_events,
            resource_timeout: self.resource_timeout,
            request_timeout: self.request_timeout,
            should_send_cookies: self.should_send_cookies,
            cookie_accept_policy: self.cookie_accept_policy,
            cache_policy: self.cache_policy,
        }
    }
}

/// Immutable view of a [`ConfigurationManager`] taken when a session is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationSnapshot {
    session_class: SessionClass,
    additional_headers: BTreeMap<String, String>,
    discretionary: bool,
    sends_launch_events: bool,
    resource_timeout: Duration,
    request_timeout: Duration,
    should_send_cookies: bool,
    cookie_accept_policy: CookieAcceptPolicy,
    cache_policy: CachePolicy,
}

impl Default for ConfigurationSnapshot {
    fn default() -> Self { ConfigurationManager::default().snapshot() }
}

impl ConfigurationSnapshot {
    pub fn session_class(&self) -> &SessionClass { &self.session_class }

    pub fn additional_headers(&self) -> &BTreeMap<String, String> { &self.additional_headers }

    pub fn is_discretionary(&self) -> bool { self.discretionary }

    pub fn sends_launch_events(&self) -> bool { self.sends_launch_events }

    pub fn resource_timeout(&self) -> Duration { self.resource_timeout }

    pub fn request_timeout(&self) -> Duration { self.request_timeout }

    pub fn should_send_cookies(&self) -> bool { self.should_send_cookies }

    pub fn cookie_accept_policy(&self) -> CookieAcceptPolicy { self.cookie_accept_policy }

    pub fn cache_policy(&self) -> CachePolicy { self.cache_policy }

    /// Whether the session should keep a cookie store at all.
    pub fn stores_cookies(&self) -> bool {
        self.should_send_cookies && self.cookie_accept_policy != CookieAcceptPolicy::Never
    }
}
