//! Shared instrument-name codec.
//!
//! All venues in the registry quote listed derivatives with the same
//! encoding: `ASSET-DDMONYY-STRIKE-{P|C}` for options and
//! `ASSET-PERPETUAL` for perpetual swaps. Options settle 08:00 UTC on the
//! expiry date.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};

use crate::models::{Asset, OptionType};

const MONTHS: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];

const SETTLEMENT_HOUR: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParsedInstrument {
    Option {
        asset: Asset,
        expiry: DateTime<Utc>,
        strike: f64,
        option_type: OptionType,
    },
    Perpetual {
        asset: Asset,
    },
}

impl ParsedInstrument {
    pub fn asset(&self) -> Asset {
        match self {
            ParsedInstrument::Option { asset, .. } => *asset,
            ParsedInstrument::Perpetual { asset } => *asset,
        }
    }

    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        match self {
            ParsedInstrument::Option { expiry, .. } => Some(*expiry),
            ParsedInstrument::Perpetual { .. } => None,
        }
    }
}

/// Decode a venue instrument name. Accepts 1- or 2-digit days so Deribit's
/// `BTC-7AUG26-...` and the canonical `BTC-07AUG26-...` both parse.
pub fn parse_instrument(name: &str) -> Option<ParsedInstrument> {
    let mut parts = name.trim().split('-');
    let asset = Asset::parse(parts.next()?)?;
    let second = parts.next()?;

    if second.eq_ignore_ascii_case("PERPETUAL") {
        return match parts.next() {
            None => Some(ParsedInstrument::Perpetual { asset }),
            Some(_) => None,
        };
    }

    let expiry = parse_expiry_tag(second)?;
    let strike: f64 = parts.next()?.parse().ok().filter(|s: &f64| *s > 0.0)?;
    let option_type = match parts.next()? {
        "P" | "p" => OptionType::Put,
        "C" | "c" => OptionType::Call,
        _ => return None,
    };
    if parts.next().is_some() {
        return None;
    }

    Some(ParsedInstrument::Option {
        asset,
        expiry,
        strike,
        option_type,
    })
}

/// `DDMONYY` -> settlement instant (08:00 UTC).
pub fn parse_expiry_tag(tag: &str) -> Option<DateTime<Utc>> {
    let tag = tag.trim().to_ascii_uppercase();
    if tag.len() < 6 || tag.len() > 7 {
        return None;
    }
    let day_len = tag.len() - 5;
    let day: u32 = tag[..day_len].parse().ok()?;
    let month = MONTHS
        .iter()
        .position(|m| *m == &tag[day_len..day_len + 3])? as u32
        + 1;
    let year: i32 = tag[day_len + 3..].parse::<i32>().ok()? + 2000;

    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    Some(Utc.from_utc_datetime(&date.and_hms_opt(SETTLEMENT_HOUR, 0, 0)?))
}

/// Settlement instant -> canonical `DDMONYY` tag.
pub fn expiry_tag(expiry: DateTime<Utc>) -> String {
    use chrono::Datelike;
    format!(
        "{:02}{}{:02}",
        expiry.day(),
        MONTHS[expiry.month0() as usize],
        expiry.year() % 100
    )
}

pub fn format_option(
    asset: Asset,
    expiry: DateTime<Utc>,
    strike: f64,
    option_type: OptionType,
) -> String {
    format!(
        "{}-{}-{}-{}",
        asset.as_str(),
        expiry_tag(expiry),
        strike.round() as i64,
        option_type.code()
    )
}

pub fn format_perp(asset: Asset) -> String {
    format!("{}-PERPETUAL", asset.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_put() {
        let parsed = parse_instrument("BTC-07AUG26-40000-P").unwrap();
        match parsed {
            ParsedInstrument::Option {
                asset,
                expiry,
                strike,
                option_type,
            } => {
                assert_eq!(asset, Asset::Btc);
                assert_eq!(strike, 40_000.0);
                assert_eq!(option_type, OptionType::Put);
                assert_eq!(expiry.to_rfc3339(), "2026-08-07T08:00:00+00:00");
            }
            _ => panic!("expected option"),
        }
    }

    #[test]
    fn test_parse_single_digit_day() {
        // Deribit drops the leading zero.
        let parsed = parse_instrument("BTC-7AUG26-40000-C").unwrap();
        assert!(matches!(
            parsed,
            ParsedInstrument::Option {
                option_type: OptionType::Call,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_perpetual() {
        assert_eq!(
            parse_instrument("BTC-PERPETUAL").unwrap(),
            ParsedInstrument::Perpetual { asset: Asset::Btc }
        );
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_instrument("ETH-07AUG26-2000-P").is_none()); // unsupported asset
        assert!(parse_instrument("BTC-07AUG26-0-P").is_none());
        assert!(parse_instrument("BTC-07XXX26-40000-P").is_none());
        assert!(parse_instrument("BTC-PERPETUAL-EXTRA").is_none());
        assert!(parse_instrument("BTC").is_none());
    }

    #[test]
    fn test_format_round_trip() {
        let expiry = parse_expiry_tag("07AUG26").unwrap();
        let name = format_option(Asset::Btc, expiry, 40_000.0, OptionType::Put);
        assert_eq!(name, "BTC-07AUG26-40000-P");
        assert!(parse_instrument(&name).is_some());
        assert_eq!(format_perp(Asset::Btc), "BTC-PERPETUAL");
    }
}
