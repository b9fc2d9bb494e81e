//! Parsers for the duration and ratio strings used in strategy specs.

use std::num::ParseFloatError;

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ParseError {
    #[error("empty value")]
    Empty,

    #[error("invalid unit {0:?}: {EXPECTED_UNITS}")]
    InvalidUnit(String),

    #[error("invalid number: {0}")]
    NotANumber(#[from] ParseFloatError),

    #[error("value out of range")]
    OutOfRange,
}

const EXPECTED_UNITS: &str = "expected one of 'ms', 's', 'm', 'min', 'minute', 'h', or 'd'";

const MILLIS_PER_SEC: f64 = 1_000.0;
const MILLIS_PER_MIN: f64 = 60.0 * MILLIS_PER_SEC;
const MILLIS_PER_HOUR: f64 = 60.0 * MILLIS_PER_MIN;
const MILLIS_PER_DAY: f64 = 24.0 * MILLIS_PER_HOUR;

/// Parses a duration such as `100ms`, `3s`, `2min` or `1h30m` into
/// milliseconds. A bare number is read as milliseconds.
pub fn parse_millis(s: &str) -> Result<i64, ParseError> {
    fn millis_per(unit: &str) -> Result<f64, ParseError> {
        match unit {
            "ms" => Ok(1.0),
            "s" => Ok(MILLIS_PER_SEC),
            "m" | "min" | "mins" | "minute" | "minutes" => Ok(MILLIS_PER_MIN),
            "h" => Ok(MILLIS_PER_HOUR),
            "d" => Ok(MILLIS_PER_DAY),
            unit => Err(ParseError::InvalidUnit(unit.to_string())),
        }
    }

    let mut s = s.trim();
    if s.is_empty() {
        return Err(ParseError::Empty);
    }

    if let Ok(millis) = s.parse::<f64>() {
        return to_millis(millis);
    }

    let mut total = 0.0;
    while !s.is_empty() {
        let unit_start = s
            .find(|c: char| c.is_alphabetic())
            .ok_or_else(|| ParseError::InvalidUnit(String::new()))?;
        let (val, rest) = s.split_at(unit_start);
        let val = val.parse::<f64>()?;
        let unit_end = rest
            .find(|c: char| !c.is_alphabetic())
            .unwrap_or(rest.len());
        let (unit, rest) = rest.split_at(unit_end);
        total += val * millis_per(unit)?;
        s = rest;
    }

    to_millis(total)
}

/// Parses a ratio such as `50%` or `0.5` into a fraction.
pub fn parse_ratio(s: &str) -> Result<f64, ParseError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ParseError::Empty);
    }
    match s.strip_suffix('%') {
        Some(pct) => Ok(pct.trim().parse::<f64>()? / 100.0),
        None => Ok(s.parse::<f64>()?),
    }
}

fn to_millis(millis: f64) -> Result<i64, ParseError> {
    if !millis.is_finite() || millis < 0.0 || millis > i64::MAX as f64 {
        return Err(ParseError::OutOfRange);
    }
    Ok(millis.round() as i64)
}
