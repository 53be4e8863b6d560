//! Config file loading for CLI defaults.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

/// `key = value` file configuration for muxfetch defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileConfig {
    /// Connect timeout in seconds.
    pub connect_timeout_secs: Option<u64>,
    /// Response body cap in bytes.
    pub max_response_size: Option<u64>,
    /// Attempts per proxy.
    pub retry_count: Option<u32>,
    /// Proxies to rotate through.
    pub proxies: Option<Vec<String>>,
    /// Pause after a full pass over the proxy list, in seconds.
    pub proxy_cycle_wait_secs: Option<u64>,
    /// Overall retry deadline per URL, in seconds.
    pub deadline_secs: Option<u64>,
    /// Replacement `User-Agent` header.
    pub user_agent: Option<String>,
}

impl FileConfig {
    /// Validates config values against the CLI constraints.
    pub fn validate(&self) -> Result<()> {
        validate_range("connect_timeout_secs", self.connect_timeout_secs, 1, 3600)?;
        validate_range(
            "max_response_size",
            self.max_response_size,
            1,
            10_000_000_000,
        )?;
        validate_range(
            "retry_count",
            self.retry_count.map(u64::from),
            1,
            100,
        )?;
        validate_range("proxy_cycle_wait_secs", self.proxy_cycle_wait_secs, 0, 3600)?;
        validate_range("deadline_secs", self.deadline_secs, 1, 86_400)?;

        if let Some(proxies) = &self.proxies {
            if let Some(empty) = proxies.iter().position(|p| p.trim().is_empty()) {
                bail!("Invalid config value for `proxies`: entry {} is empty", empty + 1);
            }
        }
        Ok(())
    }
}

fn validate_range(field: &str, value: Option<u64>, min: u64, max: u64) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !(min..=max).contains(&value) {
        bail!("Invalid config value for `{field}`: {value}. Expected range: {min}..={max}");
    }
    Ok(())
}

/// Loaded config metadata.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Config path that was considered, if any.
    pub path: Option<PathBuf>,
    /// Parsed file config when a config file exists and was valid.
    pub config: Option<FileConfig>,
}

/// Resolves default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/muxfetch/config.toml`
/// 2. `$HOME/.config/muxfetch/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("muxfetch")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("muxfetch")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads the config file.
///
/// An explicit path must exist; the default path is optional.
pub fn load_config(explicit: Option<&Path>) -> Result<LoadedConfig> {
    if let Some(path) = explicit {
        let config = load_file_config(path)?;
        return Ok(LoadedConfig {
            path: Some(path.to_path_buf()),
            config: Some(config),
        });
    }

    let path = resolve_default_config_path();
    let config = match path.as_deref() {
        Some(path_ref) if path_ref.exists() => Some(load_file_config(path_ref)?),
        _ => None,
    };
    Ok(LoadedConfig { path, config })
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!(
                "Invalid config syntax on line {}: expected key = value",
                line_index + 1
            );
        };

        let key = raw_key.trim();
        let value = raw_value.trim();
        let invalid = || format!("Invalid `{key}` value on line {}", line_index + 1);

        match key {
            "connect_timeout_secs" => {
                cfg.connect_timeout_secs = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "max_response_size" => {
                cfg.max_response_size = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "retry_count" => {
                let parsed = parse_integer_u64(value).with_context(invalid)?;
                let n = u32::try_from(parsed)
                    .map_err(|_| anyhow::anyhow!("retry_count out of range for u32"))?;
                cfg.retry_count = Some(n);
            }
            "proxies" => {
                cfg.proxies = Some(parse_string_array(value).with_context(invalid)?);
            }
            "proxy_cycle_wait_secs" => {
                cfg.proxy_cycle_wait_secs = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "deadline_secs" => {
                cfg.deadline_secs = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "user_agent" => {
                cfg.user_agent = Some(parse_string_literal(value).with_context(invalid)?);
            }
            unknown => {
                bail!(
                    "Unknown configuration key: '{}' on line {}",
                    unknown,
                    line_index + 1
                );
            }
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

/// Parses a one-line array of quoted strings: `["a", "b"]`.
fn parse_string_array(raw_value: &str) -> Result<Vec<String>> {
    let Some(inner) = raw_value
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
    else {
        bail!("Expected array of double-quoted strings");
    };

    let mut items = Vec::new();
    let mut in_string = false;
    let mut start = 0;
    for (index, ch) in inner.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            ',' if !in_string => {
                items.push(&inner[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    if in_string {
        bail!("Unterminated string in array");
    }
    items.push(&inner[start..]);

    let mut parsed = Vec::new();
    let last = items.len() - 1;
    for (position, item) in items.into_iter().enumerate() {
        let item = item.trim();
        // Allow `[]` and a trailing comma.
        if item.is_empty() && position == last {
            continue;
        }
        parsed.push(parse_string_literal(item)?);
    }
    Ok(parsed)
}

fn parse_integer_u64(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.replace('_', "").parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    u64::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u64"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_partial_fields() {
        let cfg = parse_config_str(
            r#"
retry_count = 3
user_agent = "muxfetch/0.1"
"#,
        )
        .expect("partial config should parse");
        assert_eq!(cfg.retry_count, Some(3));
        assert_eq!(cfg.user_agent.as_deref(), Some("muxfetch/0.1"));
        assert!(cfg.proxies.is_none());
    }

    #[test]
    fn test_parse_config_all_fields() {
        let cfg = parse_config_str(
            r#"
connect_timeout_secs = 15
max_response_size = 50_000_000
retry_count = 2
proxies = ["http://10.0.0.1:3128", "socks5h://10.0.0.2:1080"]
proxy_cycle_wait_secs = 0
deadline_secs = 600
user_agent = "Mozilla/5.0"
"#,
        )
        .expect("full config should parse");
        assert_eq!(cfg.connect_timeout_secs, Some(15));
        assert_eq!(cfg.max_response_size, Some(50_000_000));
        assert_eq!(
            cfg.proxies,
            Some(vec![
                "http://10.0.0.1:3128".to_string(),
                "socks5h://10.0.0.2:1080".to_string()
            ])
        );
        assert_eq!(cfg.proxy_cycle_wait_secs, Some(0));
        assert_eq!(cfg.deadline_secs, Some(600));
    }

    #[test]
    fn test_parse_config_supports_inline_comments() {
        let cfg = parse_config_str(
            r#"
retry_count = 4 # per proxy
proxies = ["http://a:1#frag", ] # trailing comma
"#,
        )
        .expect("config with comments should parse");
        assert_eq!(cfg.retry_count, Some(4));
        assert_eq!(cfg.proxies, Some(vec!["http://a:1#frag".to_string()]));
    }

    #[test]
    fn test_parse_config_empty_proxy_array() {
        let cfg = parse_config_str("proxies = []").expect("empty array should parse");
        assert_eq!(cfg.proxies, Some(Vec::new()));
    }

    #[test]
    fn test_parse_config_rejects_unquoted_proxy() {
        let err = parse_config_str("proxies = [http://a:1]").expect_err("unquoted entry");
        assert!(err.to_string().contains("proxies"));
    }

    #[test]
    fn test_parse_config_rejects_invalid_retry_count() {
        let err = parse_config_str("retry_count = 0").expect_err("invalid retry_count expected");
        assert!(err.to_string().contains("retry_count"));
    }

    #[test]
    fn test_parse_config_rejects_invalid_timeout_value() {
        let err = parse_config_str("connect_timeout_secs = 0").expect_err("invalid timeout");
        assert!(err.to_string().contains("connect_timeout_secs"));
    }

    #[test]
    fn test_parse_config_rejects_numeric_values_with_trailing_tokens() {
        let err = parse_config_str("retry_count = 4 trailing")
            .expect_err("expected trailing token error");
        assert!(err.to_string().contains("retry_count"));
    }

    #[test]
    fn test_parse_config_rejects_missing_equals() {
        let err = parse_config_str("retry_count 4").expect_err("syntax error expected");
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_parse_config_rejects_unknown_keys() {
        let err = parse_config_str("unknown_key = 123").expect_err("unknown key error expected");
        assert!(err.to_string().contains("Unknown configuration key"));
        assert!(err.to_string().contains("unknown_key"));
    }

    #[test]
    fn test_load_config_explicit_path_must_exist() {
        let missing = Path::new("/nonexistent/muxfetch/config.toml");
        assert!(load_config(Some(missing)).is_err());
    }
}
