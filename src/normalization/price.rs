use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    #[default]
    Usd,
    Eur,
    Gbp,
}

impl Currency {
    pub fn code(self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Gbp => "GBP",
        }
    }

    pub fn symbol(self) -> char {
        match self {
            Currency::Usd => '$',
            Currency::Eur => '€',
            Currency::Gbp => '£',
        }
    }

    /// Find a currency indicator (symbol or ISO code) anywhere in `text`.
    pub fn detect(text: &str) -> Option<Self> {
        let upper = text.to_ascii_uppercase();
        [Currency::Eur, Currency::Gbp, Currency::Usd]
            .into_iter()
            .find(|c| text.contains(c.symbol()) || upper.contains(c.code()))
    }
}

impl FromStr for Currency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "USD" | "$" => Ok(Currency::Usd),
            "EUR" | "€" => Ok(Currency::Eur),
            "GBP" | "£" => Ok(Currency::Gbp),
            other => Err(format!("unknown currency: {other}")),
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedPrice {
    pub amount: f64,
    pub currency: Currency,
}

/// Parse marketplace price text such as `"€2,75"`, `"$1,234.56"` or
/// `"1.234,56 €"`. Currency defaults to USD when no indicator is present.
///
/// Separator rules: when both `,` and `.` appear the later one is the
/// decimal point. A lone separator is a thousands separator when it repeats
/// or is followed by exactly three digits, otherwise it is the decimal point.
pub fn normalize_price(raw: &str) -> Option<NormalizedPrice> {
    let currency = Currency::detect(raw).unwrap_or_default();
    let amount = parse_amount(raw)?;
    Some(NormalizedPrice { amount, currency })
}

/// Numeric part of [`normalize_price`].
pub fn parse_amount(raw: &str) -> Option<f64> {
    let first_digit = raw.find(|c: char| c.is_ascii_digit())?;
    let negative = raw[..first_digit].contains('-');
    let kept: String = raw[first_digit..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || matches!(c, ',' | '.' | ' ' | '\u{a0}' | '\''))
        .filter(|c| c.is_ascii_digit() || matches!(c, ',' | '.'))
        .collect();
    let kept = kept.trim_end_matches([',', '.']);

    let last_comma = kept.rfind(',');
    let last_dot = kept.rfind('.');
    let decimal = match (last_comma, last_dot) {
        (Some(c), Some(d)) => Some(if c > d { ',' } else { '.' }),
        (Some(_), None) => lone_separator_role(kept, ','),
        (None, Some(_)) => lone_separator_role(kept, '.'),
        (None, None) => None,
    };
    let canonical: String = kept
        .chars()
        .filter_map(|c| match c {
            '0'..='9' => Some(c),
            c if Some(c) == decimal => Some('.'),
            _ => None,
        })
        .collect();
    let value = canonical.parse::<f64>().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(if negative { -value } else { value })
}

/// `Some(sep)` when `sep` is the decimal point, `None` when it groups thousands.
fn lone_separator_role(digits: &str, sep: char) -> Option<char> {
    if digits.matches(sep).count() > 1 {
        return None;
    }
    let tail = digits.rsplit(sep).next().unwrap_or_default();
    if tail.len() == 3 {
        None
    } else {
        Some(sep)
    }
}

fn group_thousands(int_part: &str, sep: char) -> String {
    let mut out = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            out.push(sep);
        }
        out.push(ch);
    }
    out
}

/// Locale-aware rendering: `$1,234.56`, `1.234,56 €`, `£1,234.56`.
pub fn format_price(amount: f64, currency: Currency) -> String {
    let fixed = format!("{:.2}", amount.abs());
    let (int_part, frac) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));
    let sign = if amount < 0.0 && fixed != "0.00" { "-" } else { "" };
    match currency {
        Currency::Eur => format!("{sign}{},{frac} €", group_thousands(int_part, '.')),
        Currency::Usd | Currency::Gbp => format!(
            "{sign}{}{}.{frac}",
            currency.symbol(),
            group_thousands(int_part, ',')
        ),
    }
}
