//! Session configuration for skein transports.
//!
//! A [`ConfigurationManager`] accumulates session-wide settings through plain
//! setters and produces an immutable [`ConfigurationSnapshot`] whenever a
//! transport session is (re)built. Settings can also be read from a TOML file
//! merged with `SKEIN_*` environment variables, see [`ConfigurationManager::load`].

mod error;
mod file;
mod session;

pub use error::ConfigError;
pub use file::ConfigFile;
pub use session::{
    CachePolicy, ConfigurationManager, ConfigurationSnapshot, CookieAcceptPolicy, SessionClass,
};
