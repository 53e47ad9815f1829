use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use alloy_primitives::{address, Address, U256};
use serde::Deserialize;
use shared::{error::SetupError, units::tokens};
use url::Url;

pub const SETTINGS_FILE: &str = "colony.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub rpc_url: String,
    pub chain_id: u64,
    pub token_address: Address,
    pub ledger_address: Address,
    pub catalog_path: Option<PathBuf>,
    pub token_symbol: String,
    pub token_decimals: u8,
    pub contribution_unit_tokens: u64,
    pub contribute_gas_limit: u64,
    pub lock_timeout_secs: u64,
    pub status_clear_secs: u64,
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8545".into(),
            chain_id: 11_155_111,
            token_address: address!("58eb07f482c3d4c524c25d0a5bd22f44adb7396d"),
            ledger_address: address!("1aec70c1bcb65a0cde00ff1a6c5d348761363d99"),
            catalog_path: None,
            token_symbol: "CLNY".into(),
            token_decimals: 18,
            contribution_unit_tokens: 1,
            contribute_gas_limit: 500_000,
            lock_timeout_secs: 60 * 60,
            status_clear_secs: 30,
            log_filter: "info".into(),
        }
    }
}

impl Settings {
    pub fn contribution_unit(&self) -> U256 {
        tokens(self.contribution_unit_tokens, self.token_decimals)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn status_clear_after(&self) -> Duration {
        Duration::from_secs(self.status_clear_secs)
    }

    pub fn validate(&self) -> Result<(), SetupError> {
        let url = Url::parse(&self.rpc_url).map_err(|err| invalid("rpc_url", err))?;
        if !matches!(url.scheme(), "http" | "https" | "ws" | "wss") {
            return Err(invalid(
                "rpc_url",
                format!("unsupported scheme '{}'", url.scheme()),
            ));
        }
        if self.token_decimals > 36 {
            return Err(invalid("token_decimals", "must be at most 36"));
        }
        if self.contribution_unit_tokens == 0 {
            return Err(invalid("contribution_unit_tokens", "must be positive"));
        }
        if self.lock_timeout_secs == 0 {
            return Err(invalid("lock_timeout_secs", "must be positive"));
        }
        if self.token_symbol.trim().is_empty() {
            return Err(invalid("token_symbol", "must not be empty"));
        }
        Ok(())
    }
}

/// Keys accepted in `colony.toml`; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    rpc_url: Option<String>,
    chain_id: Option<u64>,
    token_address: Option<Address>,
    ledger_address: Option<Address>,
    catalog_path: Option<PathBuf>,
    token_symbol: Option<String>,
    token_decimals: Option<u8>,
    contribution_unit_tokens: Option<u64>,
    contribute_gas_limit: Option<u64>,
    lock_timeout_secs: Option<u64>,
    status_clear_secs: Option<u64>,
    log_filter: Option<String>,
}

/// Defaults, then the settings file if present, then environment variables.
/// For each key the `APP__` alias wins over the `COLONY_` name.
pub fn load_settings_from<F>(path: &Path, env: F) -> Result<Settings, SetupError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        let file_cfg = toml::from_str::<FileSettings>(&raw)
            .map_err(|err| invalid("settings file", format!("{}: {err}", path.display())))?;
        apply_file(&mut settings, file_cfg);
    }

    let lookup =
        |name: &str| env(&format!("APP__{name}")).or_else(|| env(&format!("COLONY_{name}")));

    if let Some(v) = lookup("RPC_URL") {
        settings.rpc_url = v;
    }
    if let Some(v) = lookup("CHAIN_ID") {
        settings.chain_id = parse_env("chain_id", &v)?;
    }
    if let Some(v) = lookup("TOKEN_ADDRESS") {
        settings.token_address = parse_env("token_address", &v)?;
    }
    if let Some(v) = lookup("LEDGER_ADDRESS") {
        settings.ledger_address = parse_env("ledger_address", &v)?;
    }
    if let Some(v) = lookup("CATALOG_PATH") {
        settings.catalog_path = Some(PathBuf::from(v));
    }
    if let Some(v) = lookup("TOKEN_SYMBOL") {
        settings.token_symbol = v;
    }
    if let Some(v) = lookup("TOKEN_DECIMALS") {
        settings.token_decimals = parse_env("token_decimals", &v)?;
    }
    if let Some(v) = lookup("CONTRIBUTION_UNIT_TOKENS") {
        settings.contribution_unit_tokens = parse_env("contribution_unit_tokens", &v)?;
    }
    if let Some(v) = lookup("CONTRIBUTE_GAS_LIMIT") {
        settings.contribute_gas_limit = parse_env("contribute_gas_limit", &v)?;
    }
    if let Some(v) = lookup("LOCK_TIMEOUT_SECS") {
        settings.lock_timeout_secs = parse_env("lock_timeout_secs", &v)?;
    }
    if let Some(v) = lookup("STATUS_CLEAR_SECS") {
        settings.status_clear_secs = parse_env("status_clear_secs", &v)?;
    }
    if let Some(v) = lookup("LOG_FILTER") {
        settings.log_filter = v;
    }

    Ok(settings)
}

fn apply_file(settings: &mut Settings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.rpc_url {
        settings.rpc_url = v;
    }
    if let Some(v) = file_cfg.chain_id {
        settings.chain_id = v;
    }
    if let Some(v) = file_cfg.token_address {
        settings.token_address = v;
    }
    if let Some(v) = file_cfg.ledger_address {
        settings.ledger_address = v;
    }
    if file_cfg.catalog_path.is_some() {
        settings.catalog_path = file_cfg.catalog_path;
    }
    if let Some(v) = file_cfg.token_symbol {
        settings.token_symbol = v;
    }
    if let Some(v) = file_cfg.token_decimals {
        settings.token_decimals = v;
    }
    if let Some(v) = file_cfg.contribution_unit_tokens {
        settings.contribution_unit_tokens = v;
    }
    if let Some(v) = file_cfg.contribute_gas_limit {
        settings.contribute_gas_limit = v;
    }
    if let Some(v) = file_cfg.lock_timeout_secs {
        settings.lock_timeout_secs = v;
    }
    if let Some(v) = file_cfg.status_clear_secs {
        settings.status_clear_secs = v;
    }
    if let Some(v) = file_cfg.log_filter {
        settings.log_filter = v;
    }
}

fn parse_env<T>(name: &'static str, raw: &str) -> Result<T, SetupError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|err| invalid(name, err))
}

fn invalid(name: &'static str, message: impl ToString) -> SetupError {
    SetupError::InvalidSetting {
        name,
        message: message.to_string(),
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
