use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::fs;

use crate::admission::RateLimitConfig;
use crate::gateway::{DEFAULT_STDIN_MAX_BYTES, LocalLauncherConfig};
use crate::identity::{IdentityPolicy, IdentityResolver, Route};

pub const DEFAULT_CONFIG_PATH: &str = "termgate.yaml";

// ============================================================================
// Config (root)
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Username → policy. Replaces the built-in table when present.
    #[serde(default)]
    pub identities: Option<HashMap<String, IdentityPolicy>>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_saphyr::Error),

    #[error("environment variable '{0}' is not set")]
    MissingEnvVar(String),

    #[error("unclosed variable reference '${{' (missing '}}')")]
    UnclosedVarReference,

    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl Config {
    /// Read, expand and parse `path`. A missing file yields defaults.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;
        if expanded.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_saphyr::from_str(&expanded)?)
    }

    /// Reject every non-positive numeric setting and incomplete identities.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.server;
        positive("server.port", s.port as u64)?;
        positive("server.request_timeout_seconds", s.request_timeout_seconds)?;
        positive("server.max_connections", s.max_connections as u64)?;
        positive("server.shutdown_grace_seconds", s.shutdown_grace_seconds)?;
        if s.api_token.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(ConfigError::invalid("server.api_token", "must not be empty"));
        }

        let sh = &self.shell;
        positive("shell.port", sh.port as u64)?;
        positive("shell.idle_timeout_seconds", sh.idle_timeout_seconds)?;
        positive("shell.max_sessions", sh.max_sessions as u64)?;
        positive("shell.handshake_timeout_seconds", sh.handshake_timeout_seconds)?;
        positive("shell.ui.status_blink_ms", sh.ui.status_blink_ms)?;
        positive("shell.ui.cursor_blink_ms", sh.ui.cursor_blink_ms)?;
        positive("shell.ui.typewriter_ms", sh.ui.typewriter_ms)?;
        positive("shell.ui.typewriter_step", sh.ui.typewriter_step as u64)?;
        positive("shell.ui.typewriter_queue_cap", sh.ui.typewriter_queue_cap as u64)?;
        positive("shell.ui.max_buffer_lines", sh.ui.max_buffer_lines as u64)?;

        let r = &self.rate_limit;
        positive("rate_limit.window_seconds", r.window_seconds)?;
        positive("rate_limit.burst", r.burst as u64)?;
        if let Some(ban) = r.ban_seconds {
            positive("rate_limit.ban_seconds", ban)?;
        }
        positive("rate_limit.max_tracked_addresses", r.max_tracked_addresses as u64)?;
        positive("rate_limit.idle_ttl_seconds", r.idle_ttl_seconds)?;

        let g = &self.gateway;
        positive("gateway.stdin_max_bytes", g.stdin_max_bytes as u64)?;
        if g.command.trim().is_empty() {
            return Err(ConfigError::invalid("gateway.command", "must not be empty"));
        }

        if let Some(identities) = &self.identities {
            for (name, policy) in identities {
                if name.trim().is_empty() {
                    return Err(ConfigError::invalid("identities", "usernames must not be empty"));
                }
                let has_vector = policy.vector.as_deref().is_some_and(|v| !v.is_empty());
                if policy.route == Route::Vector && !has_vector {
                    return Err(ConfigError::invalid(
                        format!("identities.{name}.vector"),
                        "required when route is 'vector'",
                    ));
                }
            }
        }

        Ok(())
    }

    pub fn identity_resolver(&self) -> IdentityResolver {
        match &self.identities {
            Some(table) => IdentityResolver::new(table.clone()),
            None => IdentityResolver::builtin(),
        }
    }
}

fn positive(field: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::invalid(field, "must be a positive integer"));
    }
    Ok(())
}

/// Resolve a path relative to the config file directory.
pub fn resolve_path(config_path: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }

    let config_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    config_dir.join(path)
}

// ============================================================================
// Private Helpers (Serde Defaults)
// ============================================================================

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_connections() -> usize {
    256
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_shell_port() -> u16 {
    2323
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand `${VAR}`, `${VAR:-default}` and `$$` in a string.
///
/// ```yaml
/// server:
///   api_token: ${TERMGATE_API_TOKEN}
///   port: ${PORT:-8080}
/// ```
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }
        match chars.peek() {
            Some('$') => {
                chars.next();
                result.push('$');
            }
            Some('{') => {
                chars.next();
                result.push_str(&parse_var_reference(&mut chars)?);
            }
            _ => result.push('$'),
        }
    }

    Ok(result)
}

/// Parse the rest of a reference after `${`.
fn parse_var_reference(
    chars: &mut std::iter::Peekable<std::str::Chars>,
) -> Result<String, ConfigError> {
    let mut var_name = String::new();
    let mut default_value: Option<String> = None;

    loop {
        let Some(c) = chars.next() else {
            return Err(ConfigError::UnclosedVarReference);
        };
        if c == '}' {
            break;
        }
        if let Some(default) = default_value.as_mut() {
            default.push(c);
        } else if c == ':' && chars.peek() == Some(&'-') {
            chars.next();
            default_value = Some(String::new());
        } else {
            var_name.push(c);
        }
    }

    match std::env::var(&var_name) {
        Ok(value) => Ok(value),
        Err(_) => default_value.ok_or(ConfigError::MissingEnvVar(var_name)),
    }
}

// ============================================================================
// ServerConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Bearer token for `/gateway/*`. Unset means loopback callers only.
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_seconds: default_request_timeout(),
            max_connections: default_max_connections(),
            api_token: None,
            shutdown_grace_seconds: default_shutdown_grace(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

// ============================================================================
// ShellConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShellConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub idle_timeout_seconds: u64,
    pub max_sessions: usize,
    pub handshake_timeout_seconds: u64,
    pub ui: UiConfig,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            host: default_host(),
            port: default_shell_port(),
            idle_timeout_seconds: 300,
            max_sessions: 64,
            handshake_timeout_seconds: 30,
            ui: UiConfig::default(),
        }
    }
}

impl ShellConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_seconds)
    }
}

/// Timer periods and buffer sizes of the terminal UI.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UiConfig {
    pub status_blink_ms: u64,
    pub cursor_blink_ms: u64,
    pub typewriter_ms: u64,
    pub typewriter_step: usize,
    pub typewriter_queue_cap: usize,
    pub max_buffer_lines: usize,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            status_blink_ms: 800,
            cursor_blink_ms: 530,
            typewriter_ms: 15,
            typewriter_step: 2,
            typewriter_queue_cap: 256,
            max_buffer_lines: 1000,
        }
    }
}

// ============================================================================
// RateLimitSettings
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub window_seconds: u64,
    pub burst: u32,
    pub ban_seconds: Option<u64>,
    pub max_tracked_addresses: usize,
    pub idle_ttl_seconds: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            window_seconds: 60,
            burst: 10,
            ban_seconds: None,
            max_tracked_addresses: 10_000,
            idle_ttl_seconds: 600,
        }
    }
}

impl From<&RateLimitSettings> for RateLimitConfig {
    fn from(s: &RateLimitSettings) -> Self {
        RateLimitConfig {
            enabled: s.enabled,
            window: Duration::from_secs(s.window_seconds),
            burst: s.burst,
            ban: s.ban_seconds.map(Duration::from_secs),
            max_tracked: s.max_tracked_addresses,
            idle_ttl: Duration::from_secs(s.idle_ttl_seconds),
        }
    }
}

// ============================================================================
// GatewayConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub stdin_max_bytes: usize,
    /// Directory for the file metadata store. Unset keeps rows in memory.
    pub store_path: Option<PathBuf>,
    pub command: String,
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let launcher = LocalLauncherConfig::default();
        Self {
            stdin_max_bytes: DEFAULT_STDIN_MAX_BYTES,
            store_path: None,
            command: launcher.command,
            args: launcher.args,
            workdir: launcher.workdir,
        }
    }
}

impl GatewayConfig {
    pub fn launcher_config(&self) -> LocalLauncherConfig {
        LocalLauncherConfig {
            command: self.command.clone(),
            args: self.args.clone(),
            workdir: self.workdir.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.shell.port, 2323);
        assert_eq!(config.shell.max_sessions, 64);
        assert_eq!(config.rate_limit.burst, 10);
        assert_eq!(config.gateway.stdin_max_bytes, 65536);
        assert!(config.identities.is_none());
        config.validate().unwrap();
    }

    #[tokio::test]
    async fn load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("nope.yaml")).await.unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
    }

    #[tokio::test]
    async fn load_partial_yaml_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("termgate.yaml");
        std::fs::write(
            &path,
            "shell:\n  port: 2424\n  ui:\n    typewriter_step: 4\nrate_limit:\n  ban_seconds: 30\n",
        )
        .unwrap();

        let config = Config::load(&path).await.unwrap();
        assert_eq!(config.shell.port, 2424);
        assert_eq!(config.shell.ui.typewriter_step, 4);
        assert_eq!(config.shell.ui.cursor_blink_ms, 530);
        assert_eq!(config.rate_limit.ban_seconds, Some(30));
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn identities_replace_builtin_table() {
        let config = Config::parse(
            "identities:\n  ops:\n    route: vector\n    vector: relay\n  visitor:\n    route: triage\n",
        )
        .unwrap();
        config.validate().unwrap();

        let resolver = config.identity_resolver();
        assert_eq!(resolver.resolve("ops").preselected_vector(), Some("relay"));
        assert_eq!(resolver.resolve("visitor").route, Route::Triage);
        assert!(resolver.resolve("guest").is_rejected());
    }

    #[test]
    fn zero_values_are_fatal() {
        for yaml in [
            "shell:\n  max_sessions: 0\n",
            "rate_limit:\n  burst: 0\n",
            "rate_limit:\n  ban_seconds: 0\n",
            "gateway:\n  stdin_max_bytes: 0\n",
            "shell:\n  ui:\n    typewriter_ms: 0\n",
        ] {
            let err = Config::parse(yaml).unwrap().validate().unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { .. }), "{yaml}");
        }
    }

    #[test]
    fn negative_values_fail_to_parse() {
        assert!(matches!(
            Config::parse("shell:\n  idle_timeout_seconds: -5\n"),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn vector_route_needs_a_vector() {
        let config = Config::parse("identities:\n  ops:\n    route: vector\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("identities.ops.vector"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Config::parse("shell:\n  colour: green\n").is_err());
    }

    #[test]
    fn expand_env_vars_defaults_and_escapes() {
        assert_eq!(
            expand_env_vars("port: ${TERMGATE_TEST_UNSET_PORT:-2323}").unwrap(),
            "port: 2323"
        );
        assert_eq!(expand_env_vars("cost: $$5 or $5").unwrap(), "cost: $5 or $5");
        assert_eq!(
            expand_env_vars("token: ${TERMGATE_TEST_UNSET_EMPTY:-}").unwrap(),
            "token: "
        );
    }

    #[test]
    fn expand_env_vars_errors() {
        assert!(matches!(
            expand_env_vars("x: ${TERMGATE_TEST_UNSET_REQUIRED}"),
            Err(ConfigError::MissingEnvVar(name)) if name == "TERMGATE_TEST_UNSET_REQUIRED"
        ));
        assert!(matches!(
            expand_env_vars("x: ${OPEN"),
            Err(ConfigError::UnclosedVarReference)
        ));
    }

    #[test]
    fn rate_limit_settings_convert() {
        let limiter: RateLimitConfig = (&RateLimitSettings {
            ban_seconds: Some(5),
            ..RateLimitSettings::default()
        })
            .into();
        assert_eq!(limiter.window, Duration::from_secs(60));
        assert_eq!(limiter.ban, Some(Duration::from_secs(5)));
    }

    #[test]
    fn resolve_path_relative_to_config() {
        assert_eq!(
            resolve_path(Path::new("/etc/termgate/termgate.yaml"), Path::new("sessions")),
            PathBuf::from("/etc/termgate/sessions")
        );
        assert_eq!(
            resolve_path(Path::new("termgate.yaml"), Path::new("/var/lib/tg")),
            PathBuf::from("/var/lib/tg")
        );
    }
}
