//! Configuration for the chainflow engine.
//!
//! Configuration is loaded from a TOML file with `${VAR_NAME}` environment
//! expansion, falling back to serde defaults for everything optional.

use anyhow::{Context, Result};
use chainflow_core::CollectionMode;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bitcoin collector configuration.
    #[serde(default)]
    pub bitcoin: BitcoinConfig,

    /// Solana collector configuration.
    #[serde(default)]
    pub solana: SolanaConfig,

    /// Analytics store configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Run-level collection settings and safety budgets.
    #[serde(default)]
    pub collection: CollectionConfig,

    /// Control-plane server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Bitcoin collector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitcoinConfig {
    /// Enable the Bitcoin collector.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Prefer a local Bitcoin Core node over the public REST API.
    #[serde(default)]
    pub use_local_node: bool,

    /// Esplora-compatible public REST base URL.
    #[serde(default = "default_btc_public_api")]
    pub public_api_url: String,

    /// Local Bitcoin Core JSON-RPC URL.
    #[serde(default = "default_btc_local_rpc")]
    pub local_rpc_url: String,

    /// Basic-auth user for the local node.
    #[serde(default)]
    pub rpc_user: String,

    /// Basic-auth password for the local node.
    #[serde(default)]
    pub rpc_password: String,

    /// Starting behavior when no cursor exists.
    #[serde(default = "default_mode")]
    pub mode: CollectionMode,

    /// First position to fetch when mode is `backfill`; negative disables.
    #[serde(default = "default_start_position")]
    pub start_position: i64,

    /// Max concurrent fetches per cycle. 0 = auto (10 for backfill, 1 for tip).
    #[serde(default)]
    pub parallelism: usize,

    /// Cap on transactions fetched per block. 0 = unlimited.
    #[serde(default)]
    pub tx_limit: usize,
}

impl Default for BitcoinConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            use_local_node: false,
            public_api_url: default_btc_public_api(),
            local_rpc_url: default_btc_local_rpc(),
            rpc_user: String::new(),
            rpc_password: String::new(),
            mode: default_mode(),
            start_position: default_start_position(),
            parallelism: 0,
            tx_limit: 0,
        }
    }
}

/// Solana collector configuration.
///
/// Solana is tip-following only: upstream block retention is too short for
/// historical backfill, so `mode = "backfill"` is rejected by validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolanaConfig {
    /// Enable the Solana collector.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Solana JSON-RPC URL.
    #[serde(default = "default_sol_rpc")]
    pub rpc_url: String,

    /// Starting behavior when no cursor exists. Only `tip` is accepted.
    #[serde(default = "default_mode")]
    pub mode: CollectionMode,

    /// Accepted for symmetry with Bitcoin; unused in tip mode.
    #[serde(default = "default_start_position")]
    pub start_position: i64,

    /// Max concurrent fetches per cycle. 0 = auto.
    #[serde(default)]
    pub parallelism: usize,

    /// Cap on transactions fetched per block. 0 = unlimited.
    #[serde(default)]
    pub tx_limit: usize,
}

impl Default for SolanaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rpc_url: default_sol_rpc(),
            mode: default_mode(),
            start_position: default_start_position(),
            parallelism: 0,
            tx_limit: 0,
        }
    }
}

/// Analytics store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL (e.g. "sqlite://chainflow.db").
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
        }
    }
}

/// Run-level collection settings and safety budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Base sleep between cycles, in seconds.
    #[serde(default = "default_cycle_interval_secs")]
    pub cycle_interval_seconds: u64,

    /// Run-level wall-clock budget in minutes. 0 disables.
    #[serde(default = "default_max_duration_minutes")]
    pub max_duration_minutes: u64,

    /// Run-level storage budget in gigabytes.
    #[serde(default = "default_max_size_gb")]
    pub max_size_gb: f64,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            cycle_interval_seconds: default_cycle_interval_secs(),
            max_duration_minutes: default_max_duration_minutes(),
            max_size_gb: default_max_size_gb(),
        }
    }
}

/// Control-plane server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port to listen on.
    #[serde(default = "default_server_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_server_port(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_btc_public_api() -> String {
    "https://blockstream.info/api".to_string()
}

fn default_btc_local_rpc() -> String {
    "http://127.0.0.1:8332".to_string()
}

fn default_sol_rpc() -> String {
    "https://api.mainnet-beta.solana.com".to_string()
}

fn default_mode() -> CollectionMode {
    CollectionMode::Tip
}

fn default_start_position() -> i64 {
    -1
}

fn default_database_url() -> String {
    "sqlite://chainflow.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_min_connections() -> u32 {
    1
}

fn default_cycle_interval_secs() -> u64 {
    5
}

fn default_max_duration_minutes() -> u64 {
    10
}

fn default_max_size_gb() -> f64 {
    5.0
}

fn default_server_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

/// Effective fetch parallelism: an explicit value wins; otherwise backfill
/// gets 10 and tip-following gets 1.
pub fn effective_parallelism(configured: usize, mode: CollectionMode) -> usize {
    if configured > 0 {
        return configured;
    }
    match mode {
        CollectionMode::Backfill => 10,
        CollectionMode::Tip => 1,
    }
}

impl Config {
    /// Load configuration from a TOML file, expanding `${VAR_NAME}`
    /// placeholders from the environment before parsing. Placeholders in
    /// comments are left alone.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let expanded = expand_env_vars(&contents)?;

        let config: Config = toml::from_str(&expanded)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: Config = toml::from_str(toml).context("Failed to parse TOML configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.bitcoin.enabled {
            if self.bitcoin.public_api_url.is_empty() {
                anyhow::bail!("Bitcoin public_api_url cannot be empty");
            }
            if self.bitcoin.use_local_node && self.bitcoin.local_rpc_url.is_empty() {
                anyhow::bail!("Bitcoin local_rpc_url cannot be empty when use_local_node is set");
            }
            if self.bitcoin.mode == CollectionMode::Backfill && self.bitcoin.start_position < 0 {
                anyhow::bail!("Bitcoin backfill mode requires start_position >= 0");
            }
        }

        if self.solana.enabled {
            if self.solana.rpc_url.is_empty() {
                anyhow::bail!("Solana rpc_url cannot be empty");
            }
            // Upstream retention is too short for historical backfill.
            if self.solana.mode == CollectionMode::Backfill {
                anyhow::bail!("Solana collection is tip-following only (backfill not supported)");
            }
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be > 0");
        }
        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot exceed max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if self.collection.cycle_interval_seconds == 0 {
            anyhow::bail!("Collection cycle_interval_seconds must be > 0");
        }
        if self.collection.max_size_gb <= 0.0 {
            anyhow::bail!("Collection max_size_gb must be > 0");
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            anyhow::bail!(
                "Logging level must be one of: {} (got '{}')",
                valid_levels.join(", "),
                self.logging.level
            );
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            anyhow::bail!(
                "Logging format must be one of: {} (got '{}')",
                valid_formats.join(", "),
                self.logging.format
            );
        }

        Ok(())
    }

    /// Chains enabled by this configuration.
    pub fn enabled_chains(&self) -> Vec<chainflow_core::ChainId> {
        let mut chains = Vec::new();
        if self.bitcoin.enabled {
            chains.push(chainflow_core::ChainId::Bitcoin);
        }
        if self.solana.enabled {
            chains.push(chainflow_core::ChainId::Solana);
        }
        chains
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bitcoin: BitcoinConfig::default(),
            solana: SolanaConfig::default(),
            database: DatabaseConfig::default(),
            collection: CollectionConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Expand `${VAR_NAME}` placeholders from the environment.
///
/// Placeholders inside TOML comments are left untouched, so a config file
/// can document environment usage (`# rpc_password = "${BTC_RPC_PW}"`)
/// without requiring the variable to be set. Placeholders inside strings
/// (basic, literal, and their multiline forms) are expanded normally. An
/// unset variable, an empty name, or an unclosed placeholder is an error.
fn expand_env_vars(input: &str) -> Result<String> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Quoting {
        None,
        Basic,
        Literal,
        MultilineBasic,
        MultilineLiteral,
    }

    // Lookahead for the second and third quote of a `"""` / `'''` delimiter.
    fn starts_triple(chars: &std::iter::Peekable<std::str::Chars<'_>>, quote: char) -> bool {
        let mut look = chars.clone();
        look.next() == Some(quote) && look.next() == Some(quote)
    }

    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut quoting = Quoting::None;
    let mut in_comment = false;
    let mut escaped = false;

    while let Some(ch) = chars.next() {
        if escaped {
            escaped = false;
            result.push(ch);
            continue;
        }

        match ch {
            // Escapes only exist in basic strings.
            '\\' if matches!(quoting, Quoting::Basic | Quoting::MultilineBasic) => {
                escaped = true;
                result.push(ch);
            }
            '\n' => {
                in_comment = false;
                result.push(ch);
            }
            '"' if !in_comment
                && !matches!(quoting, Quoting::Literal | Quoting::MultilineLiteral) =>
            {
                match quoting {
                    Quoting::None if starts_triple(&chars, '"') => {
                        quoting = Quoting::MultilineBasic;
                        result.push(ch);
                        result.push(chars.next().unwrap());
                        result.push(chars.next().unwrap());
                    }
                    Quoting::None => {
                        quoting = Quoting::Basic;
                        result.push(ch);
                    }
                    Quoting::Basic => {
                        quoting = Quoting::None;
                        result.push(ch);
                    }
                    Quoting::MultilineBasic if starts_triple(&chars, '"') => {
                        quoting = Quoting::None;
                        result.push(ch);
                        result.push(chars.next().unwrap());
                        result.push(chars.next().unwrap());
                    }
                    // A lone quote inside a multiline string is content.
                    _ => result.push(ch),
                }
            }
            '\'' if !in_comment
                && !matches!(quoting, Quoting::Basic | Quoting::MultilineBasic) =>
            {
                match quoting {
                    Quoting::None if starts_triple(&chars, '\'') => {
                        quoting = Quoting::MultilineLiteral;
                        result.push(ch);
                        result.push(chars.next().unwrap());
                        result.push(chars.next().unwrap());
                    }
                    Quoting::None => {
                        quoting = Quoting::Literal;
                        result.push(ch);
                    }
                    Quoting::Literal => {
                        quoting = Quoting::None;
                        result.push(ch);
                    }
                    Quoting::MultilineLiteral if starts_triple(&chars, '\'') => {
                        quoting = Quoting::None;
                        result.push(ch);
                        result.push(chars.next().unwrap());
                        result.push(chars.next().unwrap());
                    }
                    _ => result.push(ch),
                }
            }
            '#' if quoting == Quoting::None && !in_comment => {
                in_comment = true;
                result.push(ch);
            }
            '$' if !in_comment && chars.peek() == Some(&'{') => {
                chars.next();

                let mut var_name = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    var_name.push(c);
                }

                if !closed {
                    anyhow::bail!("Unclosed environment variable placeholder in configuration");
                }
                if var_name.is_empty() {
                    anyhow::bail!("Empty environment variable name in configuration");
                }

                let value = std::env::var(&var_name)
                    .with_context(|| format!("Environment variable '{}' is not set", var_name))?;
                result.push_str(&value);
            }
            _ => result.push(ch),
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_toml_str("").unwrap();

        assert!(config.bitcoin.enabled);
        assert!(!config.bitcoin.use_local_node);
        assert_eq!(config.bitcoin.public_api_url, "https://blockstream.info/api");
        assert_eq!(config.bitcoin.mode, CollectionMode::Tip);
        assert_eq!(config.bitcoin.start_position, -1);
        assert_eq!(config.bitcoin.tx_limit, 0);

        assert!(config.solana.enabled);
        assert_eq!(config.solana.rpc_url, "https://api.mainnet-beta.solana.com");

        assert_eq!(config.database.url, "sqlite://chainflow.db");
        assert_eq!(config.database.max_connections, 5);
        assert_eq!(config.database.min_connections, 1);

        assert_eq!(config.collection.cycle_interval_seconds, 5);
        assert_eq!(config.collection.max_duration_minutes, 10);
        assert!((config.collection.max_size_gb - 5.0).abs() < f64::EPSILON);

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_load_full_config() {
        let toml = r#"
[bitcoin]
enabled = true
use_local_node = true
local_rpc_url = "http://bitcoin-core:8332"
rpc_user = "collector"
rpc_password = "hunter2"
mode = "backfill"
start_position = 0
parallelism = 5
tx_limit = 100

[solana]
enabled = false

[database]
url = "sqlite://data/chainflow.db"
max_connections = 10

[collection]
cycle_interval_seconds = 2
max_duration_minutes = 0
max_size_gb = 0.5

[server]
port = 9090
        "#;

        let config = Config::from_toml_str(toml).unwrap();
        assert_eq!(config.bitcoin.mode, CollectionMode::Backfill);
        assert_eq!(config.bitcoin.start_position, 0);
        assert_eq!(config.bitcoin.parallelism, 5);
        assert!(!config.solana.enabled);
        assert_eq!(config.collection.max_duration_minutes, 0);
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.enabled_chains(), vec![chainflow_core::ChainId::Bitcoin]);
    }

    #[test]
    fn test_validation_rejects_solana_backfill() {
        let toml = r#"
[solana]
mode = "backfill"
start_position = 100
        "#;

        let result = Config::from_toml_str(toml);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("tip-following only"));
    }

    #[test]
    fn test_validation_backfill_requires_start_position() {
        let toml = r#"
[bitcoin]
mode = "backfill"
        "#;

        let result = Config::from_toml_str(toml);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("start_position"));
    }

    #[test]
    fn test_validation_zero_cycle_interval() {
        let toml = r#"
[collection]
cycle_interval_seconds = 0
        "#;

        let result = Config::from_toml_str(toml);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("cycle_interval_seconds"));
    }

    #[test]
    fn test_validation_pool_bounds() {
        let toml = r#"
[database]
max_connections = 2
min_connections = 5
        "#;

        let result = Config::from_toml_str(toml);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("min_connections"));
    }

    #[test]
    fn test_validation_bad_log_level() {
        let toml = r#"
[logging]
level = "verbose"
        "#;

        let result = Config::from_toml_str(toml);
        assert!(result.is_err());
    }

    #[test]
    fn test_effective_parallelism() {
        assert_eq!(effective_parallelism(0, CollectionMode::Tip), 1);
        assert_eq!(effective_parallelism(0, CollectionMode::Backfill), 10);
        assert_eq!(effective_parallelism(4, CollectionMode::Tip), 4);
        assert_eq!(effective_parallelism(4, CollectionMode::Backfill), 4);
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("CHAINFLOW_TEST_VAR", "hello");
        let result = expand_env_vars("value is ${CHAINFLOW_TEST_VAR}").unwrap();
        assert_eq!(result, "value is hello");
        std::env::remove_var("CHAINFLOW_TEST_VAR");

        let result = expand_env_vars("no variables here").unwrap();
        assert_eq!(result, "no variables here");
    }

    #[test]
    fn test_expand_env_vars_undefined() {
        let result = expand_env_vars("value is ${CHAINFLOW_UNDEFINED_VAR_12345}");
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("CHAINFLOW_UNDEFINED_VAR_12345"));
    }

    #[test]
    fn test_expand_env_vars_unclosed() {
        let result = expand_env_vars("value is ${UNCLOSED");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Unclosed"));
    }

    #[test]
    fn test_expand_env_vars_empty_name() {
        let result = expand_env_vars("value is ${}");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Empty"));
    }

    #[test]
    fn test_config_with_env_vars() {
        std::env::set_var("CHAINFLOW_TEST_RPC_PASSWORD", "secret");

        let toml = r#"
[bitcoin]
use_local_node = true
rpc_user = "collector"
rpc_password = "${CHAINFLOW_TEST_RPC_PASSWORD}"
        "#;

        let expanded = expand_env_vars(toml).unwrap();
        let config = Config::from_toml_str(&expanded).unwrap();
        assert_eq!(config.bitcoin.rpc_password, "secret");

        std::env::remove_var("CHAINFLOW_TEST_RPC_PASSWORD");
    }

    #[test]
    fn test_expand_env_vars_ignores_comments() {
        // Documenting env usage in a comment must not require the variable.
        let input = "# example: rpc_password = \"${CHAINFLOW_NOT_SET_ANYWHERE}\"\nport = 8080\n";
        let result = expand_env_vars(input).unwrap();
        assert!(result.contains("${CHAINFLOW_NOT_SET_ANYWHERE}"));
        assert!(result.contains("port = 8080"));
    }

    #[test]
    fn test_expand_env_vars_comment_after_value() {
        std::env::set_var("CHAINFLOW_TEST_INLINE", "secret");

        let input = r#"rpc_password = "${CHAINFLOW_TEST_INLINE}"  # e.g. "${OTHER_VAR}""#;
        let result = expand_env_vars(input).unwrap();

        assert!(result.contains("secret"));
        assert!(result.contains("${OTHER_VAR}"));

        std::env::remove_var("CHAINFLOW_TEST_INLINE");
    }

    #[test]
    fn test_expand_env_vars_hash_inside_string() {
        std::env::set_var("CHAINFLOW_TEST_FRAGMENT", "token");

        // A '#' inside a string is content, not a comment.
        let input = r##"url = "https://example.com/#${CHAINFLOW_TEST_FRAGMENT}""##;
        let result = expand_env_vars(input).unwrap();
        assert!(result.contains("https://example.com/#token"));

        std::env::remove_var("CHAINFLOW_TEST_FRAGMENT");
    }

    #[test]
    fn test_expand_env_vars_apostrophe_in_multiline_literal() {
        // The apostrophe must not leave the scanner in string mode, or the
        // placeholder in the following comment would be expanded.
        let input = r#"
description = '''
It's fine
'''
# reference: ${CHAINFLOW_NOT_SET_ANYWHERE}
"#;
        let result = expand_env_vars(input).unwrap();
        assert!(result.contains("It's fine"));
        assert!(result.contains("${CHAINFLOW_NOT_SET_ANYWHERE}"));
    }

    #[test]
    fn test_expand_env_vars_expands_inside_multiline_string() {
        std::env::set_var("CHAINFLOW_TEST_MULTILINE", "expanded");

        let input = r#"
text = """
line with ${CHAINFLOW_TEST_MULTILINE}
"""
# ${CHAINFLOW_NOT_SET_ANYWHERE}
"#;
        let result = expand_env_vars(input).unwrap();
        assert!(result.contains("line with expanded"));
        assert!(result.contains("${CHAINFLOW_NOT_SET_ANYWHERE}"));

        std::env::remove_var("CHAINFLOW_TEST_MULTILINE");
    }

    #[test]
    fn test_expand_env_vars_escaped_quote_in_string() {
        std::env::set_var("CHAINFLOW_TEST_ESCAPED", "value");

        let input = r#"key = "a \" quote and ${CHAINFLOW_TEST_ESCAPED}""#;
        let result = expand_env_vars(input).unwrap();
        assert!(result.contains(r#"a \" quote and value"#));

        std::env::remove_var("CHAINFLOW_TEST_ESCAPED");
    }

    #[test]
    fn test_config_with_commented_placeholder_examples() {
        std::env::set_var("CHAINFLOW_TEST_REAL_PW", "hunter2");

        let toml = r#"
[bitcoin]
use_local_node = true
rpc_user = "collector"
# Keep credentials in the environment:
# rpc_password = "${BITCOIN_CORE_RPC_PASSWORD}"
rpc_password = "${CHAINFLOW_TEST_REAL_PW}"
        "#;

        let expanded = expand_env_vars(toml).unwrap();
        let config = Config::from_toml_str(&expanded).unwrap();

        assert_eq!(config.bitcoin.rpc_password, "hunter2");
        assert!(expanded.contains("${BITCOIN_CORE_RPC_PASSWORD}"));

        std::env::remove_var("CHAINFLOW_TEST_REAL_PW");
    }

    #[test]
    fn test_example_config_loads_out_of_the_box() {
        // The shipped example documents `${VAR}` usage in comments; copying
        // it verbatim must produce a loadable configuration.
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../chainflow.toml.example");
        let config = Config::from_file(path).unwrap();
        assert!(config.bitcoin.enabled);
        assert!(config.solana.enabled);
    }
}
