//! Runtime configuration from the environment

use crate::backend::FixKind;
use crate::backend_api::{discover_socket, Endpoint};
use crate::guard::GuardScope;
use crate::status::EntityId;
use log::debug;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

const ENV_BACKEND_URL: &str = "LTOPS_BACKEND_URL";
const ENV_BACKEND_SOCKET: &str = "LTOPS_BACKEND_SOCKET";
const ENV_PLUGIN: &str = "LTOPS_PLUGIN";
const ENV_POLL_MS: &str = "LTOPS_POLL_MS";
const ENV_NAV_POLL_MS: &str = "LTOPS_NAV_POLL_MS";
const ENV_GUARD_SCOPE: &str = "LTOPS_GUARD_SCOPE";
const ENV_FIX_URL: &str = "LTOPS_FIX_URL";
const ENV_GENERIC_FIX_URL: &str = "LTOPS_GENERIC_FIX_URL";
const ENV_START_URL: &str = "LTOPS_START_URL";

const DEFAULT_PLUGIN: &str = "luatools";
const DEFAULT_NAV_POLL_MS: u64 = 500;
const DEFAULT_FIX_URL: &str = "https://files.luatools.work/OnlineFix1/{appid}.zip";
const DEFAULT_GENERIC_FIX_URL: &str = "https://files.luatools.work/GameBypasses/{appid}.zip";
const DEFAULT_START_URL: &str = "https://store.steampowered.com/";
const APPID_PLACEHOLDER: &str = "{appid}";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "No LuaTools backend found: set LTOPS_BACKEND_URL or LTOPS_BACKEND_SOCKET, \
         or start the backend on its standard socket"
    )]
    NoBackend,
    #[error("{name} is not a valid URL: {source}")]
    InvalidUrl {
        name: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error("{name} must be a positive number of milliseconds, got '{value}'")]
    InvalidDuration { name: &'static str, value: String },
    #[error("LTOPS_GUARD_SCOPE must be 'entity' or 'entity-kind', got '{0}'")]
    InvalidScope(String),
    #[error("{name} must contain {{appid}}, got '{value}'")]
    MissingPlaceholder { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub endpoint: Endpoint,
    pub plugin: String,
    /// Applies to every kind when set.
    pub poll_override: Option<Duration>,
    pub nav_poll_interval: Duration,
    pub guard_scope: GuardScope,
    pub fix_urls: FixUrls,
    pub start_url: Url,
}

/// Fix archive locations, with `{appid}` standing for the app. The generic
/// archive always lives here; the online one only when the fix check
/// names no URL of its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixUrls {
    online: String,
    generic: String,
}

impl Default for FixUrls {
    fn default() -> Self {
        Self {
            online: DEFAULT_FIX_URL.to_string(),
            generic: DEFAULT_GENERIC_FIX_URL.to_string(),
        }
    }
}

impl FixUrls {
    pub fn url(&self, kind: FixKind, appid: EntityId) -> String {
        let template = match kind {
            FixKind::Online => &self.online,
            FixKind::Generic => &self.generic,
        };
        template.replace(APPID_PLACEHOLDER, &appid.to_string())
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let endpoint = match (var(ENV_BACKEND_URL), var(ENV_BACKEND_SOCKET)) {
            (Some(url), _) => Endpoint::Http(parse_url(ENV_BACKEND_URL, &url)?),
            (None, Some(path)) => Endpoint::Socket(PathBuf::from(path)),
            (None, None) => {
                Endpoint::Socket(discover_socket().map_err(|_| ConfigError::NoBackend)?)
            }
        };
        debug!("Using backend at {}", endpoint);

        let guard_scope = match var(ENV_GUARD_SCOPE).as_deref() {
            None | Some("entity") => GuardScope::Entity,
            Some("entity-kind") => GuardScope::EntityAndKind,
            Some(other) => return Err(ConfigError::InvalidScope(other.to_string())),
        };

        let fix_urls = FixUrls {
            online: url_template(ENV_FIX_URL, var(ENV_FIX_URL), DEFAULT_FIX_URL)?,
            generic: url_template(
                ENV_GENERIC_FIX_URL,
                var(ENV_GENERIC_FIX_URL),
                DEFAULT_GENERIC_FIX_URL,
            )?,
        };

        let start_url = parse_url(
            ENV_START_URL,
            &var(ENV_START_URL).unwrap_or_else(|| DEFAULT_START_URL.to_string()),
        )?;

        Ok(Self {
            endpoint,
            plugin: var(ENV_PLUGIN).unwrap_or_else(|| DEFAULT_PLUGIN.to_string()),
            poll_override: var(ENV_POLL_MS)
                .map(|value| parse_millis(ENV_POLL_MS, &value))
                .transpose()?,
            nav_poll_interval: var(ENV_NAV_POLL_MS)
                .map(|value| parse_millis(ENV_NAV_POLL_MS, &value))
                .transpose()?
                .unwrap_or(Duration::from_millis(DEFAULT_NAV_POLL_MS)),
            guard_scope,
            fix_urls,
            start_url,
        })
    }

}

fn url_template(
    name: &'static str,
    value: Option<String>,
    default: &str,
) -> Result<String, ConfigError> {
    let template = value.unwrap_or_else(|| default.to_string());
    if !template.contains(APPID_PLACEHOLDER) {
        return Err(ConfigError::MissingPlaceholder {
            name,
            value: template,
        });
    }
    Ok(template)
}

fn parse_url(name: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|source| ConfigError::InvalidUrl { name, source })
}

fn parse_millis(name: &'static str, value: &str) -> Result<Duration, ConfigError> {
    match value.parse::<u64>() {
        Ok(ms) if ms > 0 => Ok(Duration::from_millis(ms)),
        _ => Err(ConfigError::InvalidDuration {
            name,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn http_backend_with_defaults() {
        let config = config(&[("LTOPS_BACKEND_URL", "http://127.0.0.1:8787/")]).unwrap();
        assert_eq!(
            config.endpoint,
            Endpoint::Http(Url::parse("http://127.0.0.1:8787/").unwrap())
        );
        assert_eq!(config.plugin, "luatools");
        assert_eq!(config.guard_scope, GuardScope::Entity);
        assert_eq!(config.poll_override, None);
        assert_eq!(config.fix_urls, FixUrls::default());
        assert_eq!(config.nav_poll_interval, Duration::from_millis(500));
        assert_eq!(config.start_url.as_str(), "https://store.steampowered.com/");
    }

    #[test]
    fn url_wins_over_socket() {
        let config = config(&[
            ("LTOPS_BACKEND_URL", "http://localhost:9000/"),
            ("LTOPS_BACKEND_SOCKET", "/run/luatools/backend.sock"),
        ])
        .unwrap();
        assert!(matches!(config.endpoint, Endpoint::Http(_)));
    }

    #[test]
    fn socket_path_is_taken_as_given() {
        let config = config(&[("LTOPS_BACKEND_SOCKET", "/run/luatools/backend.sock")]).unwrap();
        assert_eq!(
            config.endpoint,
            Endpoint::Socket(PathBuf::from("/run/luatools/backend.sock"))
        );
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config(&[
            ("LTOPS_BACKEND_URL", "http://localhost:9000/"),
            ("LTOPS_POLL_MS", "250"),
            ("LTOPS_NAV_POLL_MS", " 1000 "),
            ("LTOPS_GUARD_SCOPE", "entity-kind"),
            ("LTOPS_PLUGIN", "luatools-dev"),
        ])
        .unwrap();
        assert_eq!(config.poll_override, Some(Duration::from_millis(250)));
        assert_eq!(config.nav_poll_interval, Duration::from_millis(1000));
        assert_eq!(config.guard_scope, GuardScope::EntityAndKind);
        assert_eq!(config.plugin, "luatools-dev");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let base = ("LTOPS_BACKEND_URL", "http://localhost:9000/");
        assert!(matches!(
            config(&[base, ("LTOPS_POLL_MS", "0")]),
            Err(ConfigError::InvalidDuration { .. })
        ));
        assert!(matches!(
            config(&[base, ("LTOPS_GUARD_SCOPE", "global")]),
            Err(ConfigError::InvalidScope(_))
        ));
        assert!(matches!(
            config(&[base, ("LTOPS_FIX_URL", "https://example.com/fix.zip")]),
            Err(ConfigError::MissingPlaceholder {
                name: "LTOPS_FIX_URL",
                ..
            })
        ));
        assert!(matches!(
            config(&[base, ("LTOPS_GENERIC_FIX_URL", "https://example.com/generic.zip")]),
            Err(ConfigError::MissingPlaceholder {
                name: "LTOPS_GENERIC_FIX_URL",
                ..
            })
        ));
        assert!(matches!(
            config(&[("LTOPS_BACKEND_URL", "not a url")]),
            Err(ConfigError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn fix_url_substitutes_appid() {
        let config = config(&[
            ("LTOPS_BACKEND_URL", "http://localhost:9000/"),
            ("LTOPS_FIX_URL", "https://mirror.example/fixes/{appid}.zip"),
        ])
        .unwrap();
        assert_eq!(
            config.fix_urls.url(FixKind::Online, EntityId(220)),
            "https://mirror.example/fixes/220.zip"
        );
        assert_eq!(
            config.fix_urls.url(FixKind::Generic, EntityId(220)),
            "https://files.luatools.work/GameBypasses/220.zip"
        );
    }
}
