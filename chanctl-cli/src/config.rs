use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chanctl::{DisplayUnit, FiatRate};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use url::Url;

pub const DEFAULT_URL: &str = "https://127.0.0.1:8080";
pub const DEFAULT_DIR: &str = ".chanctl";
pub const CONFIG_FILE: &str = "config.toml";
pub const DEFAULT_TIME_LOCK_DELTA: u32 = 40;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 30;

/// Contents of the configuration file.  Every field is optional, command line
/// flags take precedence.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct Config {
    pub url: Option<String>,
    pub macaroon: Option<String>,
    pub accept_invalid_certs: Option<bool>,
    pub data_dir: Option<String>,
    pub log_level: Option<String>,
    pub unit: Option<String>,
    pub time_lock_delta: Option<u32>,
    pub force_close: Option<bool>,
    pub timeout_secs: Option<u64>,
    pub sync_interval_secs: Option<u64>,

    pub fiat: Option<ConfigFiat>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct ConfigFiat {
    pub code: Option<String>,
    pub symbol: Option<String>,
    pub btc_price: Option<f64>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("could not read config file {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("could not parse config file {}", path.display()))
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    #[clap(short = 'f', long, value_parser, help = "configuration file", value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[clap(long, value_parser, help = "node REST endpoint", value_name = "URL")]
    pub url: Option<Url>,

    #[clap(long, value_parser, help = "admin macaroon file", value_name = "FILE")]
    pub macaroon: Option<PathBuf>,

    #[clap(long, help = "accept a self-signed node certificate")]
    pub accept_invalid_certs: bool,

    #[clap(short, long, value_parser, help = "data directory", value_name = "DIR")]
    pub datadir: Option<PathBuf>,

    #[clap(
        long,
        help = "set the logging level",
        value_name = "LEVEL",
        value_parser = ["off", "error", "warn", "info", "debug", "trace"],
    )]
    pub log_level: Option<String>,

    #[clap(short, long, help = "display unit", value_name = "UNIT", value_parser = parse_unit)]
    pub unit: Option<DisplayUnit>,

    #[clap(long, help = "price of one bitcoin in fiat", value_name = "PRICE")]
    pub fiat_price: Option<f64>,

    #[clap(long, help = "fiat currency code", value_name = "CODE")]
    pub fiat_code: Option<String>,

    #[clap(long, help = "fiat currency symbol", value_name = "SYMBOL")]
    pub fiat_symbol: Option<String>,

    #[clap(subcommand)]
    pub command: Command,
}

fn parse_unit(s: &str) -> Result<DisplayUnit, String> {
    s.parse()
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Inspect or close channels
    #[clap(subcommand)]
    Channel(ChannelCommand),
    /// Inspect or change channel fee policies
    #[clap(subcommand)]
    Fees(FeesCommand),
    /// Keep the channel list in sync and print it on every change
    Watch {
        #[clap(long, help = "seconds between syncs", value_name = "SECS")]
        interval: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ChannelCommand {
    /// List open and pending channels
    List,
    /// Show the details of one channel
    Show {
        #[clap(help = "funding txid and output index, txid:index")]
        channel_point: String,
    },
    /// Close a channel
    Close {
        #[clap(help = "funding txid and output index, txid:index")]
        channel_point: String,
        #[clap(long, help = "confirm the close")]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum FeesCommand {
    /// Show the fee policy of a channel
    Show { channel_point: String },
    /// Set the fee policy of a channel
    Set {
        channel_point: String,
        #[clap(help = "base fee in millisatoshi", allow_hyphen_values = true)]
        base_fee_msat: String,
        #[clap(help = "proportional fee rate, e.g. 0.000001 for 1 ppm", allow_hyphen_values = true)]
        fee_rate: String,
    },
}

/// Everything the commands need, with flags, config file and defaults merged
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub url: Url,
    pub macaroon: Option<PathBuf>,
    pub accept_invalid_certs: bool,
    pub datadir: PathBuf,
    pub log_level: String,
    pub unit: DisplayUnit,
    pub fiat: Option<FiatRate>,
    pub time_lock_delta: u32,
    pub force_close: bool,
    pub timeout: Duration,
    pub sync_interval: Duration,
}

pub fn default_datadir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(DEFAULT_DIR)
}

/// The config file named on the command line, or the one in the data
/// directory if there is one
pub fn load_config(args: &Args) -> Result<Config> {
    if let Some(path) = &args.config {
        return Config::load(path);
    }
    let path = args.datadir.clone().unwrap_or_else(default_datadir).join(CONFIG_FILE);
    if path.exists() {
        Config::load(path)
    } else {
        Ok(Config::default())
    }
}

impl Settings {
    pub fn resolve(args: &Args, config: Config) -> Result<Settings> {
        let url = match (&args.url, &config.url) {
            (Some(url), _) => url.clone(),
            (None, Some(url)) => Url::parse(url).with_context(|| format!("bad url {}", url))?,
            (None, None) => Url::parse(DEFAULT_URL)?,
        };
        let unit = match (args.unit, &config.unit) {
            (Some(unit), _) => unit,
            (None, Some(unit)) => unit.parse().map_err(|e: String| anyhow!(e))?,
            (None, None) => DisplayUnit::Sats,
        };

        let fiat_config = config.fiat.unwrap_or_default();
        let fiat = args.fiat_price.or(fiat_config.btc_price).map(|btc_price| {
            let code = args.fiat_code.clone().or(fiat_config.code);
            let symbol = args.fiat_symbol.clone().or(fiat_config.symbol);
            FiatRate {
                code: code.unwrap_or_else(|| "USD".to_string()),
                symbol: symbol.unwrap_or_else(|| "$".to_string()),
                btc_price,
            }
        });
        if let Some(rate) = &fiat {
            if !rate.btc_price.is_finite() || rate.btc_price <= 0.0 {
                return Err(anyhow!("fiat price must be positive, got {}", rate.btc_price));
            }
        }

        Ok(Settings {
            url,
            macaroon: args.macaroon.clone().or(config.macaroon.map(PathBuf::from)),
            accept_invalid_certs: args.accept_invalid_certs
                || config.accept_invalid_certs.unwrap_or(false),
            datadir: args
                .datadir
                .clone()
                .or(config.data_dir.map(PathBuf::from))
                .unwrap_or_else(default_datadir),
            log_level: args
                .log_level
                .clone()
                .or(config.log_level)
                .unwrap_or_else(|| "info".to_string()),
            unit,
            fiat,
            time_lock_delta: config.time_lock_delta.unwrap_or(DEFAULT_TIME_LOCK_DELTA),
            force_close: config.force_close.unwrap_or(false),
            timeout: Duration::from_secs(config.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)),
            sync_interval: Duration::from_secs(
                config.sync_interval_secs.unwrap_or(DEFAULT_SYNC_INTERVAL_SECS),
            ),
        })
    }

    /// The macaroon file contents, hex encoded for the request header
    pub fn macaroon_hex(&self) -> Result<Option<String>> {
        match &self.macaroon {
            None => Ok(None),
            Some(path) => {
                let bytes = fs::read(path)
                    .with_context(|| format!("could not read macaroon {}", path.display()))?;
                Ok(Some(hex::encode(bytes)))
            }
        }
    }
}
