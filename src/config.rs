//! Runtime configuration, read once from the environment at startup.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use alloy::primitives::utils::{parse_ether, parse_units};
use alloy::primitives::{Address, U256};
use alloy::signers::local::PrivateKeySigner;
use chrono::DateTime;
use serde_json::Value;
use url::Url;

use crate::error::{MintError, Result};
use crate::gas_station::FeeQuote;
use crate::mint::MintCall;

pub const DEFAULT_FLASHBOTS_RELAY: &str = "https://relay.flashbots.net";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Single,
    Multi,
    MultiParallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    Public,
    Flashbots,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceStrategy {
    Pending,
    Latest,
    Manual(u64),
}

/// How hard the public path escalates fees between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BumpPolicy {
    /// 1.5x the base bump, 2x once past the third attempt.
    Aggressive,
    /// The base bump every time.
    Conservative,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: RunMode,

    pub rpc_urls: Vec<Url>,
    pub priority_rpc: Option<Url>,
    pub rpc_timeout: Duration,
    pub rpc_retry_count: u32,
    pub prefer_priority_rpc: bool,

    pub contract_address: Address,
    pub mint_call: MintCall,
    pub mint_price: U256,
    pub mint_amount: U256,

    pub gas_limit: Option<u64>,
    pub gas_limit_buffer_percent: u64,

    pub submit_mode: SubmitMode,
    pub nonce_strategy: NonceStrategy,
    pub nonce_offset: u64,

    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    pub retry_backoff_multiplier: f64,
    pub gas_bump_percent: u64,
    pub bump_policy: BumpPolicy,

    pub fee_override: Option<FeeQuote>,
    pub dynamic_fee_multiplier: f64,
    pub max_fee_cap: u128,

    pub private_keys: Vec<PrivateKeySigner>,
    pub concurrency: usize,
    pub tx_delay: Duration,
    pub jitter: Duration,

    pub call_static_check: bool,
    pub balance_check: bool,
    pub mempool_monitoring: bool,
    pub preload_nonces: bool,
    pub wait_next_block: bool,
    pub dry_run: bool,

    pub start_at_block: Option<u64>,
    /// Unix time in milliseconds.
    pub start_at_timestamp: Option<i64>,

    pub flashbots_relays: Vec<Url>,
    pub flashbots_auth_key: PrivateKeySigner,
    pub confirmation_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any variable source. Blank values count
    /// as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let mode = match env.get("MODE").as_deref().map(str::to_lowercase).as_deref() {
            None | Some("single") => RunMode::Single,
            Some("multi") => RunMode::Multi,
            Some("multi_parallel") => RunMode::MultiParallel,
            Some(other) => return Err(MintError::Config(format!("unknown MODE `{other}`"))),
        };

        let mut rpc_urls = env.list("RPC_URLS");
        if let Some(url) = env.get("RPC_URL") {
            if !rpc_urls.contains(&url) {
                rpc_urls.insert(0, url);
            }
        }
        let rpc_urls = rpc_urls
            .iter()
            .map(|raw| parse_url("RPC_URLS", raw))
            .collect::<Result<Vec<_>>>()?;
        let priority_rpc = env
            .get("PRIORITY_RPC")
            .map(|raw| parse_url("PRIORITY_RPC", &raw))
            .transpose()?;
        if rpc_urls.is_empty() && priority_rpc.is_none() {
            return Err(MintError::Config("RPC_URL or RPC_URLS is required".into()));
        }

        let contract_address = env
            .get("CONTRACT_ADDRESS")
            .ok_or_else(|| MintError::Config("CONTRACT_ADDRESS is required".into()))?
            .parse::<Address>()
            .map_err(|e| MintError::Config(format!("CONTRACT_ADDRESS: {e}")))?;

        let mint_amount: U256 = env.parse_or("MINT_AMOUNT", U256::from(1))?;
        let args = match env.get("MINT_ARGS_JSON") {
            Some(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Array(args)) => args,
                Ok(_) => return Err(MintError::Config("MINT_ARGS_JSON must be a JSON array".into())),
                Err(e) => return Err(MintError::Config(format!("MINT_ARGS_JSON: {e}"))),
            },
            None => vec![Value::String(mint_amount.to_string())],
        };
        let mint_func = env.get("MINT_FUNC").unwrap_or_else(|| "mint".to_string());
        let mint_call = match env.get("ABI_OVERRIDE") {
            Some(abi) => MintCall::from_abi_json(&abi, &mint_func, &args)?,
            None => MintCall::from_signature(
                &format!("function {mint_func}(uint256 _count) payable"),
                &args,
            )?,
        };
        let mint_price = match env.get("MINT_PRICE") {
            Some(raw) => {
                parse_ether(&raw).map_err(|e| MintError::Config(format!("MINT_PRICE: {e}")))?
            }
            None => U256::ZERO,
        };

        let submit_mode = match env.get("SUBMIT_MODE").as_deref().map(str::to_lowercase).as_deref() {
            None | Some("public") => SubmitMode::Public,
            Some("flashbots") => SubmitMode::Flashbots,
            Some(other) => {
                return Err(MintError::Config(format!("unknown SUBMIT_MODE `{other}`")));
            }
        };

        let nonce_strategy = match env.get("NONCE_STRATEGY").as_deref().map(str::to_lowercase).as_deref() {
            None | Some("pending") => NonceStrategy::Pending,
            Some("latest") => NonceStrategy::Latest,
            Some("manual") => NonceStrategy::Manual(
                env.parse::<u64>("NONCE")?
                    .ok_or_else(|| MintError::Config("NONCE_STRATEGY=manual requires NONCE".into()))?,
            ),
            Some(other) => {
                return Err(MintError::Config(format!("unknown NONCE_STRATEGY `{other}`")));
            }
        };

        let bump_policy = match env.get("BUMP_POLICY").as_deref().map(str::to_lowercase).as_deref() {
            None | Some("aggressive") => BumpPolicy::Aggressive,
            Some("conservative") => BumpPolicy::Conservative,
            Some(other) => return Err(MintError::Config(format!("unknown BUMP_POLICY `{other}`"))),
        };

        let fee_override = match (
            env.gwei("MAX_FEE_GWEI")?,
            env.gwei("MAX_PRIORITY_GWEI")?,
            env.gwei("GAS_PRICE_GWEI")?,
        ) {
            (Some(max_fee_per_gas), Some(max_priority_fee_per_gas), _) => {
                if max_priority_fee_per_gas > max_fee_per_gas {
                    return Err(MintError::Config(format!(
                        "MAX_PRIORITY_GWEI ({max_priority_fee_per_gas} wei) exceeds MAX_FEE_GWEI ({max_fee_per_gas} wei)"
                    )));
                }
                Some(FeeQuote::Eip1559 {
                    max_fee_per_gas,
                    max_priority_fee_per_gas,
                })
            }
            (_, _, Some(gas_price)) => Some(FeeQuote::Legacy { gas_price }),
            _ => None,
        };

        let aggressive_bump = env.parse_or("AGGRESSIVE_GAS_BUMP", 25u64)?;
        let max_fee_cap = env.gwei("MAX_FEE_CAP_GWEI")?.unwrap_or(500 * 1_000_000_000);

        let private_keys = match mode {
            RunMode::Single => env
                .get("PRIVATE_KEY")
                .or_else(|| env.list("PRIVATE_KEYS").into_iter().next())
                .map(|key| vec![key])
                .ok_or_else(|| MintError::Config("PRIVATE_KEY is required in single mode".into()))?,
            RunMode::Multi | RunMode::MultiParallel => {
                let keys = env.list("PRIVATE_KEYS");
                if keys.is_empty() {
                    return Err(MintError::Config("PRIVATE_KEYS is required in multi modes".into()));
                }
                keys
            }
        }
        .iter()
        .map(|key| parse_signer("PRIVATE_KEYS", key))
        .collect::<Result<Vec<_>>>()?;

        let start_at_timestamp = env
            .get("START_AT_TIMESTAMP")
            .map(|raw| parse_timestamp_ms(&raw))
            .transpose()?;

        let mut relays = env.list("FLASHBOTS_RELAYS");
        if relays.is_empty() {
            relays.push(env.get("FLASHBOTS_RELAY").unwrap_or_else(|| DEFAULT_FLASHBOTS_RELAY.to_string()));
        }
        let flashbots_relays = relays
            .iter()
            .map(|raw| parse_url("FLASHBOTS_RELAYS", raw))
            .collect::<Result<Vec<_>>>()?;
        let flashbots_auth_key = match env.get("FLASHBOTS_AUTH_KEY") {
            Some(key) => parse_signer("FLASHBOTS_AUTH_KEY", &key)?,
            None => PrivateKeySigner::random(),
        };

        Ok(Self {
            mode,
            rpc_urls,
            priority_rpc,
            rpc_timeout: env.millis_or("RPC_TIMEOUT_MS", 3_000)?,
            rpc_retry_count: env.parse_or("RPC_RETRY_COUNT", 2u32)?,
            prefer_priority_rpc: env.flag("PREFER_PRIORITY_RPC", true),
            contract_address,
            mint_call,
            mint_price,
            mint_amount,
            gas_limit: env.parse("GAS_LIMIT")?,
            gas_limit_buffer_percent: env.parse_or("GAS_LIMIT_BUFFER_PERCENT", 25u64)?,
            submit_mode,
            nonce_strategy,
            nonce_offset: env.parse_or("NONCE_OFFSET", 0u64)?,
            retry_attempts: env.parse_or("RETRY_ATTEMPTS", 8u32)?,
            retry_backoff: env.millis_or("RETRY_BACKOFF_MS", 1_000)?,
            retry_backoff_multiplier: env.parse_or("RETRY_BACKOFF_MULTIPLIER", 1.5f64)?,
            gas_bump_percent: env.parse_or("GAS_BUMP_PERCENT", aggressive_bump)?,
            bump_policy,
            fee_override,
            dynamic_fee_multiplier: env.parse_or("DYNAMIC_FEE_MULTIPLIER", 1.2f64)?,
            max_fee_cap,
            private_keys,
            concurrency: env.parse_or("CONCURRENCY", 6usize)?.max(1),
            tx_delay: env.millis_or("TX_DELAY_MS", 0)?,
            jitter: env.millis_or("JITTER_MS", 100)?,
            call_static_check: env.flag("CALLSTATIC_CHECK", true),
            balance_check: env.flag("BALANCE_CHECK", true),
            mempool_monitoring: env.flag("MEMPOOL_MONITORING", true),
            preload_nonces: env.flag("PRELOAD_NONCES", true),
            wait_next_block: env.flag("WAIT_NEXT_BLOCK", false),
            dry_run: env.flag("DRY_RUN", false),
            start_at_block: env.parse("START_AT_BLOCK")?,
            start_at_timestamp,
            flashbots_relays,
            flashbots_auth_key,
            confirmation_timeout: env.millis_or("CONFIRMATION_TIMEOUT_MS", 180_000)?,
        })
    }

    /// Value sent with each mint: `price * amount`.
    pub fn mint_value(&self) -> U256 {
        self.mint_price.saturating_mul(self.mint_amount)
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn list(&self, name: &str) -> Vec<String> {
        self.get(name)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.get(name)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|e| MintError::Config(format!("{name}=`{raw}`: {e}")))
            })
            .transpose()
    }

    fn parse_or<T>(&self, name: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        Ok(self.parse(name)?.unwrap_or(default))
    }

    fn millis_or(&self, name: &str, default: u64) -> Result<Duration> {
        self.parse_or(name, default).map(Duration::from_millis)
    }

    /// Only a case-insensitive `true` enables a flag.
    fn flag(&self, name: &str, default: bool) -> bool {
        self.get(name)
            .map(|raw| raw.eq_ignore_ascii_case("true"))
            .unwrap_or(default)
    }

    fn gwei(&self, name: &str) -> Result<Option<u128>> {
        let Some(raw) = self.get(name) else {
            return Ok(None);
        };
        let wei = parse_units(&raw, "gwei")
            .map_err(|e| MintError::Config(format!("{name}=`{raw}`: {e}")))?
            .get_absolute();
        u128::try_from(wei)
            .map(Some)
            .map_err(|_| MintError::Config(format!("{name}=`{raw}` is out of range")))
    }
}

fn parse_url(name: &str, raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| MintError::Config(format!("{name}: invalid url `{raw}`: {e}")))
}

fn parse_signer(name: &str, raw: &str) -> Result<PrivateKeySigner> {
    raw.parse::<PrivateKeySigner>()
        .map_err(|e| MintError::Config(format!("{name}: invalid private key: {e}")))
}

/// Accepts unix milliseconds or an RFC 3339 date.
fn parse_timestamp_ms(raw: &str) -> Result<i64> {
    if let Ok(ms) = raw.parse::<i64>() {
        return Ok(ms);
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| MintError::Config(format!("START_AT_TIMESTAMP=`{raw}`: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const KEY: &str = "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let mut env: HashMap<String, String> = [
            ("RPC_URL", "http://localhost:8545"),
            ("CONTRACT_ADDRESS", "0x00000000000000000000000000000000000000aa"),
            ("PRIVATE_KEY", KEY),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (k, v) in vars {
            env.insert(k.to_string(), v.to_string());
        }
        Config::from_lookup(|name| env.get(name).cloned())
    }

    #[test]
    fn defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.mode, RunMode::Single);
        assert_eq!(config.submit_mode, SubmitMode::Public);
        assert_eq!(config.nonce_strategy, NonceStrategy::Pending);
        assert_eq!(config.bump_policy, BumpPolicy::Aggressive);
        assert_eq!(config.retry_attempts, 8);
        assert_eq!(config.retry_backoff, Duration::from_millis(1000));
        assert_eq!(config.gas_bump_percent, 25);
        assert_eq!(config.gas_limit_buffer_percent, 25);
        assert_eq!(config.concurrency, 6);
        assert_eq!(config.rpc_retry_count, 2);
        assert_eq!(config.max_fee_cap, 500_000_000_000);
        assert_eq!(config.fee_override, None);
        assert_eq!(config.mint_value(), U256::ZERO);
        assert_eq!(config.mint_call.signature(), "mint(uint256)");
        assert_eq!(config.flashbots_relays[0].as_str(), "https://relay.flashbots.net/");
        assert!(config.mempool_monitoring && config.preload_nonces && !config.dry_run);
    }

    #[test]
    fn fee_overrides_prefer_the_eip1559_pair() {
        let config = load(&[
            ("MAX_FEE_GWEI", "40"),
            ("MAX_PRIORITY_GWEI", "2.5"),
            ("GAS_PRICE_GWEI", "30"),
        ])
        .unwrap();
        assert_eq!(
            config.fee_override,
            Some(FeeQuote::Eip1559 {
                max_fee_per_gas: 40_000_000_000,
                max_priority_fee_per_gas: 2_500_000_000,
            })
        );

        let legacy = load(&[("MAX_FEE_GWEI", "40"), ("GAS_PRICE_GWEI", "30")]).unwrap();
        assert_eq!(legacy.fee_override, Some(FeeQuote::Legacy { gas_price: 30_000_000_000 }));
    }

    #[test]
    fn priority_above_max_fee_is_rejected() {
        let err = load(&[("MAX_FEE_GWEI", "2"), ("MAX_PRIORITY_GWEI", "3")]).unwrap_err();
        assert!(matches!(err, MintError::Config(msg) if msg.contains("MAX_PRIORITY_GWEI")));

        let equal = load(&[("MAX_FEE_GWEI", "3"), ("MAX_PRIORITY_GWEI", "3")]).unwrap();
        assert_eq!(
            equal.fee_override,
            Some(FeeQuote::Eip1559 {
                max_fee_per_gas: 3_000_000_000,
                max_priority_fee_per_gas: 3_000_000_000,
            })
        );
    }

    #[test]
    fn manual_nonce_requires_value() {
        assert!(matches!(
            load(&[("NONCE_STRATEGY", "manual")]),
            Err(MintError::Config(_))
        ));
        let config = load(&[("NONCE_STRATEGY", "Manual"), ("NONCE", "12")]).unwrap();
        assert_eq!(config.nonce_strategy, NonceStrategy::Manual(12));
    }

    #[test]
    fn missing_contract_is_rejected() {
        let env: HashMap<&str, &str> = [("RPC_URL", "http://localhost:8545"), ("PRIVATE_KEY", KEY)]
            .into_iter()
            .collect();
        let err = Config::from_lookup(|name| env.get(name).map(|v| v.to_string())).unwrap_err();
        assert!(matches!(err, MintError::Config(msg) if msg.contains("CONTRACT_ADDRESS")));
    }

    #[test]
    fn multi_modes_need_key_list() {
        assert!(load(&[("MODE", "multi")]).is_err());
        let config = load(&[("MODE", "multi_parallel"), ("PRIVATE_KEYS", &format!("{KEY}, {KEY}"))]).unwrap();
        assert_eq!(config.private_keys.len(), 2);
        assert_eq!(config.mode, RunMode::MultiParallel);
    }

    #[test]
    fn mint_args_and_value() {
        let config = load(&[
            ("MINT_ARGS_JSON", "[3]"),
            ("MINT_AMOUNT", "3"),
            ("MINT_PRICE", "0.01"),
        ])
        .unwrap();
        assert_eq!(config.mint_value(), parse_ether("0.03").unwrap());
        assert!(load(&[("MINT_ARGS_JSON", "{\"a\":1}")]).is_err());
        assert!(load(&[("MINT_ARGS_JSON", "[1, 2]")]).is_err());
    }

    #[test]
    fn flags_and_concurrency_floor() {
        let config = load(&[
            ("DRY_RUN", "TRUE"),
            ("MEMPOOL_MONITORING", "no"),
            ("CONCURRENCY", "0"),
        ])
        .unwrap();
        assert!(config.dry_run);
        assert!(!config.mempool_monitoring);
        assert_eq!(config.concurrency, 1);
    }

    #[test]
    fn start_timestamp_accepts_millis_and_rfc3339() {
        assert_eq!(parse_timestamp_ms("1700000000000").unwrap(), 1_700_000_000_000);
        assert_eq!(
            parse_timestamp_ms("2023-11-14T22:13:20Z").unwrap(),
            1_700_000_000_000
        );
        assert!(parse_timestamp_ms("tomorrow").is_err());
    }

    #[test]
    fn relay_list_and_rpc_merge() {
        let config = load(&[
            ("RPC_URLS", "http://a:8545,http://b:8545"),
            ("FLASHBOTS_RELAYS", "https://r1.example, https://r2.example"),
        ])
        .unwrap();
        assert_eq!(config.rpc_urls.len(), 3);
        assert_eq!(config.rpc_urls[0].as_str(), "http://localhost:8545/");
        assert_eq!(config.flashbots_relays.len(), 2);
    }
}
