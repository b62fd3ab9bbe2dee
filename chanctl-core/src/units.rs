//! Conversion between satoshi amounts and the selected display denomination.

use core::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use log::*;

use crate::error::Error;

const SATS_PER_BTC: u64 = 100_000_000;

/// Display denomination, cycled by [`UnitConverter::change_unit`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisplayUnit {
    Sats,
    Btc,
    Fiat,
}

impl DisplayUnit {
    /// Cycle order
    pub const ALL: [DisplayUnit; 3] = [DisplayUnit::Sats, DisplayUnit::Btc, DisplayUnit::Fiat];

    /// The next unit, wrapping around
    pub fn next(self) -> DisplayUnit {
        match self {
            DisplayUnit::Sats => DisplayUnit::Btc,
            DisplayUnit::Btc => DisplayUnit::Fiat,
            DisplayUnit::Fiat => DisplayUnit::Sats,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DisplayUnit::Sats => "sats",
            DisplayUnit::Btc => "btc",
            DisplayUnit::Fiat => "fiat",
        }
    }
}

impl fmt::Display for DisplayUnit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DisplayUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sats" | "sat" => Ok(DisplayUnit::Sats),
            "btc" => Ok(DisplayUnit::Btc),
            "fiat" => Ok(DisplayUnit::Fiat),
            _ => Err(format!("unknown unit {:?}, expected one of sats, btc, fiat", s)),
        }
    }
}

/// Price of one bitcoin in some fiat currency
#[derive(Clone, Debug, PartialEq)]
pub struct FiatRate {
    /// Currency code, e.g. USD
    pub code: String,
    /// Prefix used when rendering, e.g. $
    pub symbol: String,
    pub btc_price: f64,
}

struct State {
    unit: DisplayUnit,
    fiat: Option<FiatRate>,
}

/// Renders satoshi amounts in the currently selected unit.
///
/// One converter is shared (via `Arc`) by every call site that renders an amount,
/// so a unit change shows up on the next render everywhere.
pub struct UnitConverter {
    state: Mutex<State>,
}

impl Default for UnitConverter {
    fn default() -> Self {
        Self::new(DisplayUnit::Sats)
    }
}

impl UnitConverter {
    pub fn new(unit: DisplayUnit) -> Self {
        UnitConverter { state: Mutex::new(State { unit, fiat: None }) }
    }

    pub fn with_fiat_rate(unit: DisplayUnit, rate: FiatRate) -> Self {
        UnitConverter { state: Mutex::new(State { unit, fiat: Some(rate) }) }
    }

    pub fn unit(&self) -> DisplayUnit {
        self.state.lock().unwrap().unit
    }

    pub fn set_unit(&self, unit: DisplayUnit) {
        self.state.lock().unwrap().unit = unit;
    }

    /// Advance to the next display unit and return it
    pub fn change_unit(&self) -> DisplayUnit {
        let mut state = self.state.lock().unwrap();
        state.unit = state.unit.next();
        debug!("display unit is now {}", state.unit);
        state.unit
    }

    pub fn set_fiat_rate(&self, rate: Option<FiatRate>) {
        self.state.lock().unwrap().fiat = rate;
    }

    pub fn fiat_rate(&self) -> Option<FiatRate> {
        self.state.lock().unwrap().fiat.clone()
    }

    /// Render an amount that may be absent.
    ///
    /// Absent and negative amounts render as zero in the current unit.
    pub fn get_amount(&self, value: Option<i64>) -> String {
        let sats = value.and_then(|v| u64::try_from(v).ok()).unwrap_or(0);
        self.format_sats(sats)
    }

    /// Render a satoshi amount in the current unit
    pub fn format_sats(&self, sats: u64) -> String {
        let state = self.state.lock().unwrap();
        match (state.unit, state.fiat.as_ref()) {
            (DisplayUnit::Sats, _) | (DisplayUnit::Fiat, None) =>
                format!("{} sats", group_thousands(sats as u128)),
            (DisplayUnit::Btc, _) => format_btc(sats),
            (DisplayUnit::Fiat, Some(rate)) => format_fiat(sats, rate),
        }
    }

    /// Convert user input, typed in the current unit, to satoshis
    pub fn to_base_units(&self, input: &str) -> Result<u64, Error> {
        let state = self.state.lock().unwrap();
        let cleaned: String =
            input.trim().chars().filter(|c| *c != ',' && *c != '_' && *c != ' ').collect();
        match state.unit {
            DisplayUnit::Sats => parse_sats(cleaned.trim_end_matches("sats")),
            DisplayUnit::Btc => parse_btc(cleaned.trim_start_matches('₿')),
            DisplayUnit::Fiat => {
                let rate = state
                    .fiat
                    .as_ref()
                    .ok_or_else(|| Error::InvalidAmount("no fiat rate available".to_string()))?;
                parse_fiat(cleaned.trim_start_matches(rate.symbol.as_str()), rate)
            }
        }
    }
}

fn group_thousands(value: u128) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

fn format_btc(sats: u64) -> String {
    let whole = sats / SATS_PER_BTC;
    let frac = sats % SATS_PER_BTC;
    if frac == 0 {
        return format!("₿{}", group_thousands(whole as u128));
    }
    let frac = format!("{:08}", frac);
    format!("₿{}.{}", group_thousands(whole as u128), frac.trim_end_matches('0'))
}

fn format_fiat(sats: u64, rate: &FiatRate) -> String {
    let value = sats as f64 * rate.btc_price / SATS_PER_BTC as f64;
    let cents = if value.is_finite() && value > 0.0 { (value * 100.0).round() as u128 } else { 0 };
    format!("{}{}.{:02}", rate.symbol, group_thousands(cents / 100), cents % 100)
}

fn parse_sats(s: &str) -> Result<u64, Error> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidAmount(format!("{:?} is not a whole number of sats", s)));
    }
    s.parse::<u64>().map_err(|_| Error::InvalidAmount(format!("{} sats is out of range", s)))
}

fn parse_btc(s: &str) -> Result<u64, Error> {
    let invalid = || Error::InvalidAmount(format!("{:?} is not a btc amount", s));
    let (whole, frac) = s.split_once('.').unwrap_or((s, ""));
    if whole.is_empty() && frac.is_empty() {
        return Err(invalid());
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    if frac.len() > 8 {
        return Err(Error::InvalidAmount(format!("{:?} has more than 8 decimals", s)));
    }
    let whole: u64 = if whole.is_empty() { 0 } else { whole.parse().map_err(|_| invalid())? };
    let frac: u64 =
        if frac.is_empty() { 0 } else { format!("{:0<8}", frac).parse().map_err(|_| invalid())? };
    whole.checked_mul(SATS_PER_BTC).and_then(|w| w.checked_add(frac)).ok_or_else(invalid)
}

fn parse_fiat(s: &str, rate: &FiatRate) -> Result<u64, Error> {
    let invalid = || Error::InvalidAmount(format!("{:?} is not a {} amount", s, rate.code));
    let value: f64 = s.parse().map_err(|_| invalid())?;
    if !value.is_finite() || value < 0.0 || !(rate.btc_price > 0.0) {
        return Err(invalid());
    }
    let sats = (value / rate.btc_price * SATS_PER_BTC as f64).round();
    if sats > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(sats as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usd() -> FiatRate {
        FiatRate { code: "USD".to_string(), symbol: "$".to_string(), btc_price: 50_000.0 }
    }

    #[test]
    fn cycle_test() {
        let converter = UnitConverter::default();
        let start = converter.unit();
        for _ in 0..DisplayUnit::ALL.len() {
            converter.change_unit();
        }
        assert_eq!(converter.unit(), start);
        assert_eq!(converter.change_unit(), DisplayUnit::Btc);
        assert_eq!(converter.change_unit(), DisplayUnit::Fiat);
        assert_eq!(converter.change_unit(), DisplayUnit::Sats);
    }

    #[test]
    fn zero_and_absent_render_the_same_test() {
        let converter = UnitConverter::with_fiat_rate(DisplayUnit::Sats, usd());
        for _ in DisplayUnit::ALL {
            assert_eq!(converter.get_amount(Some(0)), converter.get_amount(None));
            assert_eq!(converter.get_amount(Some(-5)), converter.get_amount(None));
            converter.change_unit();
        }
        converter.set_fiat_rate(None);
        converter.set_unit(DisplayUnit::Fiat);
        assert_eq!(converter.get_amount(Some(0)), converter.get_amount(None));
    }

    #[test]
    fn format_test() {
        let converter = UnitConverter::with_fiat_rate(DisplayUnit::Sats, usd());
        assert_eq!(converter.get_amount(Some(1234567)), "1,234,567 sats");
        assert_eq!(converter.get_amount(None), "0 sats");
        assert_eq!(converter.format_sats(999), "999 sats");

        converter.set_unit(DisplayUnit::Btc);
        assert_eq!(converter.format_sats(1234), "₿0.00001234");
        assert_eq!(converter.format_sats(150_000_000), "₿1.5");
        assert_eq!(converter.format_sats(0), "₿0");

        converter.set_unit(DisplayUnit::Fiat);
        assert_eq!(converter.format_sats(100_000_000), "$50,000.00");
        assert_eq!(converter.format_sats(1), "$0.00");
        assert_eq!(converter.format_sats(2_000), "$1.00");

        converter.set_fiat_rate(None);
        assert_eq!(converter.format_sats(2_000), "2,000 sats");
    }

    #[test]
    fn to_base_units_test() {
        let converter = UnitConverter::new(DisplayUnit::Sats);
        assert_eq!(converter.to_base_units("1,000").unwrap(), 1000);
        assert_eq!(converter.to_base_units(" 42 sats").unwrap(), 42);
        assert!(converter.to_base_units("-1").is_err());
        assert!(converter.to_base_units("1.5").is_err());
        assert!(converter.to_base_units("").is_err());

        converter.set_unit(DisplayUnit::Btc);
        assert_eq!(converter.to_base_units("0.00001234").unwrap(), 1234);
        assert_eq!(converter.to_base_units("₿1.5").unwrap(), 150_000_000);
        assert_eq!(converter.to_base_units(".1").unwrap(), 10_000_000);
        assert!(converter.to_base_units("0.000000001").is_err());
        assert!(converter.to_base_units(".").is_err());

        converter.set_unit(DisplayUnit::Fiat);
        assert!(matches!(converter.to_base_units("5"), Err(Error::InvalidAmount(_))));
        converter.set_fiat_rate(Some(usd()));
        assert_eq!(converter.to_base_units("$1.00").unwrap(), 2_000);
        assert!(converter.to_base_units("-1").is_err());
    }

    #[test]
    fn parse_unit_test() {
        assert_eq!("BTC".parse::<DisplayUnit>().unwrap(), DisplayUnit::Btc);
        assert_eq!("sats".parse::<DisplayUnit>().unwrap(), DisplayUnit::Sats);
        assert!("eur".parse::<DisplayUnit>().is_err());
    }
}
