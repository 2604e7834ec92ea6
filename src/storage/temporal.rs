//! Text forms of DATE, TIME, TIMESTAMP and DECIMAL values.

use std::fmt;
use std::str::FromStr;

use nom::branch::alt;
use nom::character::complete::{char, digit1};
use nom::combinator::{all_consuming, map_res, opt};
use nom::sequence::{preceded, tuple};
use nom::IResult;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const MICROS_PER_SECOND: i64 = 1_000_000;
pub const MICROS_PER_DAY: i64 = 86_400 * MICROS_PER_SECOND;

/// Number of fractional digits carried by [`Decimal`].
pub const DECIMAL_SCALE: u32 = 6;
const DECIMAL_FACTOR: i128 = 1_000_000;

/// Fixed-point decimal stored as an integer count of 10^-6 units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Decimal {
    units: i128,
}

impl Decimal {
    pub fn from_units(units: i128) -> Self {
        Self { units }
    }

    pub fn units(&self) -> i128 {
        self.units
    }

    pub fn from_i64(v: i64) -> Self {
        Self {
            units: v as i128 * DECIMAL_FACTOR,
        }
    }

    pub fn to_f64(&self) -> f64 {
        self.units as f64 / DECIMAL_FACTOR as f64
    }

    pub fn parse(text: &str) -> Result<Self> {
        let parsed = all_consuming(decimal_parts)(text.trim())
            .map_err(|_| Error::TypeMismatch(format!("invalid DECIMAL literal '{}'", text)))?;
        let (_, (negative, whole, frac)) = parsed;
        if frac.len() > DECIMAL_SCALE as usize {
            return Err(Error::TypeMismatch(format!(
                "DECIMAL literal '{}' has more than {} fractional digits",
                text, DECIMAL_SCALE
            )));
        }
        let overflow = || Error::TypeMismatch(format!("DECIMAL literal '{}' out of range", text));
        let whole: i128 = whole.parse().map_err(|_| overflow())?;
        let mut frac_units: i128 = 0;
        for (i, digit) in frac.bytes().enumerate() {
            let place = 10i128.pow(DECIMAL_SCALE - 1 - i as u32);
            frac_units += (digit - b'0') as i128 * place;
        }
        let units = whole
            .checked_mul(DECIMAL_FACTOR)
            .and_then(|w| w.checked_add(frac_units))
            .ok_or_else(overflow)?;
        Ok(Self {
            units: if negative { -units } else { units },
        })
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.units < 0 { "-" } else { "" };
        let abs = self.units.unsigned_abs();
        let whole = abs / DECIMAL_FACTOR as u128;
        let frac = abs % DECIMAL_FACTOR as u128;
        if frac == 0 {
            return write!(f, "{}{}", sign, whole);
        }
        let digits = format!("{:06}", frac);
        write!(f, "{}{}.{}", sign, whole, digits.trim_end_matches('0'))
    }
}

fn decimal_parts(input: &str) -> IResult<&str, (bool, &str, &str)> {
    let (input, sign) = opt(alt((char('-'), char('+'))))(input)?;
    let (input, whole) = digit1(input)?;
    let (input, frac) = opt(preceded(char('.'), digit1))(input)?;
    Ok((input, (sign == Some('-'), whole, frac.unwrap_or(""))))
}

fn number<T: FromStr>(input: &str) -> IResult<&str, T> {
    map_res(digit1, str::parse::<T>)(input)
}

fn date_parts(input: &str) -> IResult<&str, (i32, u32, u32)> {
    let (input, (neg, year, _, month, _, day)) = tuple((
        opt(char('-')),
        number::<i32>,
        char('-'),
        number::<u32>,
        char('-'),
        number::<u32>,
    ))(input)?;
    let year = if neg.is_some() { -year } else { year };
    Ok((input, (year, month, day)))
}

fn time_parts(input: &str) -> IResult<&str, (u32, u32, u32, &str)> {
    let (input, (hour, _, minute, _, second, frac)) = tuple((
        number::<u32>,
        char(':'),
        number::<u32>,
        char(':'),
        number::<u32>,
        opt(preceded(char('.'), digit1)),
    ))(input)?;
    Ok((input, (hour, minute, second, frac.unwrap_or(""))))
}

fn timestamp_parts(input: &str) -> IResult<&str, ((i32, u32, u32), Option<(u32, u32, u32, &str)>)> {
    let (input, date) = date_parts(input)?;
    let (input, time) = opt(preceded(alt((char(' '), char('T'))), time_parts))(input)?;
    Ok((input, (date, time)))
}

fn is_leap(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if is_leap(year) => 29,
        2 => 28,
        _ => 0,
    }
}

/// Days since 1970-01-01 for a proleptic Gregorian date.
pub fn days_from_civil(year: i32, month: u32, day: u32) -> i32 {
    let y = if month <= 2 { year as i64 - 1 } else { year as i64 };
    let era = (if y >= 0 { y } else { y - 399 }) / 400;
    let yoe = y - era * 400;
    let m = month as i64;
    let shifted = if m > 2 { m - 3 } else { m + 9 };
    let doy = (153 * shifted + 2) / 5 + day as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    (era * 146_097 + doe - 719_468) as i32
}

pub fn civil_from_days(days: i32) -> (i32, u32, u32) {
    let z = days as i64 + 719_468;
    let era = (if z >= 0 { z } else { z - 146_096 }) / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + if month <= 2 { 1 } else { 0 };
    (year as i32, month as u32, day as u32)
}

fn check_date(text: &str, (year, month, day): (i32, u32, u32)) -> Result<i32> {
    if month == 0 || month > 12 || day == 0 || day > days_in_month(year, month) {
        return Err(Error::TypeMismatch(format!("invalid date '{}'", text)));
    }
    Ok(days_from_civil(year, month, day))
}

fn check_time(text: &str, (hour, minute, second, frac): (u32, u32, u32, &str)) -> Result<i64> {
    if hour > 23 || minute > 59 || second > 59 || frac.len() > 6 {
        return Err(Error::TypeMismatch(format!("invalid time '{}'", text)));
    }
    let mut micros: i64 = 0;
    for (i, digit) in frac.bytes().enumerate() {
        micros += (digit - b'0') as i64 * 10i64.pow(5 - i as u32);
    }
    Ok((hour as i64 * 3600 + minute as i64 * 60 + second as i64) * MICROS_PER_SECOND + micros)
}

/// Parse `YYYY-MM-DD` into days since the epoch.
pub fn parse_date(text: &str) -> Result<i32> {
    let (_, parts) = all_consuming(date_parts)(text.trim())
        .map_err(|_| Error::TypeMismatch(format!("invalid date '{}'", text)))?;
    check_date(text, parts)
}

/// Parse `HH:MM:SS[.ffffff]` into microseconds since midnight.
pub fn parse_time(text: &str) -> Result<i64> {
    let (_, parts) = all_consuming(time_parts)(text.trim())
        .map_err(|_| Error::TypeMismatch(format!("invalid time '{}'", text)))?;
    check_time(text, parts)
}

/// Parse `YYYY-MM-DD[( |T)HH:MM:SS[.ffffff]]` into microseconds since the epoch.
pub fn parse_timestamp(text: &str) -> Result<i64> {
    let (_, (date, time)) = all_consuming(timestamp_parts)(text.trim())
        .map_err(|_| Error::TypeMismatch(format!("invalid timestamp '{}'", text)))?;
    let days = check_date(text, date)?;
    let micros = match time {
        Some(parts) => check_time(text, parts)?,
        None => 0,
    };
    Ok(days as i64 * MICROS_PER_DAY + micros)
}

pub fn format_date(days: i32) -> String {
    let (y, m, d) = civil_from_days(days);
    format!("{:04}-{:02}-{:02}", y, m, d)
}

pub fn format_time(micros: i64) -> String {
    let secs = micros.div_euclid(MICROS_PER_SECOND);
    let frac = micros.rem_euclid(MICROS_PER_SECOND);
    let (h, m, s) = (secs / 3600, (secs / 60) % 60, secs % 60);
    if frac == 0 {
        format!("{:02}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}:{:02}.{:06}", h, m, s, frac)
    }
}

pub fn format_timestamp(micros: i64) -> String {
    let days = micros.div_euclid(MICROS_PER_DAY);
    let rest = micros.rem_euclid(MICROS_PER_DAY);
    format!("{} {}", format_date(days as i32), format_time(rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_date_round_trip() {
        assert_eq!(parse_date("1970-01-01").unwrap(), 0);
        assert_eq!(parse_date("2000-03-01").unwrap(), 11_017);
        let days = parse_date("2024-02-29").unwrap();
        assert_eq!(format_date(days), "2024-02-29");
        assert!(parse_date("2023-02-29").is_err());
        assert!(parse_date("2023-13-01").is_err());
    }

    #[test]
    fn test_time_and_timestamp() {
        assert_eq!(parse_time("00:00:01").unwrap(), MICROS_PER_SECOND);
        assert_eq!(format_time(parse_time("12:34:56.5").unwrap()), "12:34:56.500000");
        let ts = parse_timestamp("1970-01-02 00:00:00").unwrap();
        assert_eq!(ts, MICROS_PER_DAY);
        assert_eq!(
            format_timestamp(parse_timestamp("2021-06-30T23:59:59").unwrap()),
            "2021-06-30 23:59:59"
        );
        assert!(parse_time("24:00:00").is_err());
    }

    #[test]
    fn test_decimal_parse_and_display() {
        assert_eq!(Decimal::parse("12.5").unwrap().to_string(), "12.5");
        assert_eq!(Decimal::parse("-0.000001").unwrap().units(), -1);
        assert_eq!(Decimal::parse("42").unwrap(), Decimal::from_i64(42));
        assert!(Decimal::parse("1.1234567").is_err());
        assert!(Decimal::parse("abc").is_err());
    }
}
