//! Token amounts in their decoded text form (`"1.2345 EOS"`).

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid asset '{0}'")]
pub struct AssetError(pub String);

/// An amount in the token's smallest unit plus its symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub amount: i64,
    pub precision: u8,
    pub symbol: String,
}

impl FromStr for Asset {
    type Err = AssetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AssetError(s.to_string());
        let (number, symbol) = s.trim().split_once(' ').ok_or_else(invalid)?;
        if symbol.is_empty() || symbol.len() > 7 || !symbol.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(invalid());
        }

        let (negative, digits) = match number.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, number),
        };
        let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
        if whole.is_empty() || !whole.bytes().chain(frac.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let precision = u8::try_from(frac.len()).map_err(|_| invalid())?;
        let units: i64 = format!("{whole}{frac}").parse().map_err(|_| invalid())?;

        Ok(Self {
            amount: if negative { -units } else { units },
            precision,
            symbol: symbol.to_string(),
        })
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.amount < 0 { "-" } else { "" };
        let abs = self.amount.unsigned_abs();
        if self.precision == 0 {
            return write!(f, "{sign}{abs} {}", self.symbol);
        }
        let scale = 10u64.pow(u32::from(self.precision));
        write!(
            f,
            "{sign}{}.{:0width$} {}",
            abs / scale,
            abs % scale,
            self.symbol,
            width = self.precision as usize
        )
    }
}
