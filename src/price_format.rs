// =============================================================================
// Numeric format classifier
// =============================================================================
//
// Assigns every instrument an asset class from its price magnitude and quoted
// digit count, and splits a price into the big-figure / pips / pipettes parts
// the renderer lays out typographically. This module is the single source of
// truth for what "pip" means per instrument.
//
// Classification rules, first match wins:
//   1. price >= 100 000                    -> high-value crypto
//   2. price >= 1 000                      -> high-value commodity
//   3. price >= 100 and 3 quoted decimals  -> JPY-style FX pair
//   4. 5 or 3 quoted decimals              -> standard FX
//   5. otherwise                           -> generic decimal

use serde::{Deserialize, Serialize};

/// Closed set of instrument classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    HighValueCrypto,
    HighValueCommodity,
    FxJpy,
    FxStandard,
    GenericDecimal,
}

impl std::fmt::Display for AssetClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HighValueCrypto => write!(f, "high_value_crypto"),
            Self::HighValueCommodity => write!(f, "high_value_commodity"),
            Self::FxJpy => write!(f, "fx_jpy"),
            Self::FxStandard => write!(f, "fx_standard"),
            Self::GenericDecimal => write!(f, "generic_decimal"),
        }
    }
}

/// Typographic decomposition of a price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceParts {
    pub big_figure: String,
    pub pips: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipettes: Option<String>,
}

/// Classify an instrument. Total over every `(price > 0, digit_count)` pair.
pub fn classify(price: f64, digit_count: u32) -> AssetClass {
    if price >= 100_000.0 {
        AssetClass::HighValueCrypto
    } else if price >= 1_000.0 {
        AssetClass::HighValueCommodity
    } else if price >= 100.0 && digit_count == 3 {
        AssetClass::FxJpy
    } else if digit_count == 5 || digit_count == 3 {
        AssetClass::FxStandard
    } else {
        AssetClass::GenericDecimal
    }
}

/// The conventional quote increment for an asset class.
pub fn pip_size(class: AssetClass, digit_count: u32) -> f64 {
    match class {
        // Integer tens: the displayed pip pair covers hundreds + tens.
        AssetClass::HighValueCrypto | AssetClass::HighValueCommodity => 10.0,
        AssetClass::FxJpy => 0.01,
        AssetClass::FxStandard => {
            if digit_count == 3 {
                0.01
            } else {
                0.0001
            }
        }
        AssetClass::GenericDecimal => 10f64.powi(-(digit_count.min(8) as i32)),
    }
}

/// Default market-profile quantization step for an asset class.
pub fn default_bucket_size(class: AssetClass, pip: f64) -> f64 {
    match class {
        AssetClass::HighValueCrypto => 100.0,
        AssetClass::HighValueCommodity => 1.0,
        _ => pip * 10.0,
    }
}

/// Split `price` into big-figure / pips / pipettes for its asset class.
pub fn split_price(price: f64, digit_count: u32) -> PriceParts {
    let class = classify(price, digit_count);
    match class {
        AssetClass::HighValueCrypto => {
            // e.g. 123456.78 -> big "123", pips "45", pipettes "6".
            let i = price.trunc() as i64;
            PriceParts {
                big_figure: format!("{}", i / 1_000),
                pips: format!("{:02}", (i % 1_000) / 10),
                pipettes: Some(format!("{}", i % 10)),
            }
        }
        AssetClass::HighValueCommodity => {
            // e.g. 2345.60 -> big "2", pips "34".
            let i = price.trunc() as i64;
            PriceParts {
                big_figure: format!("{}", i / 1_000),
                pips: format!("{:02}", (i % 1_000) / 10),
                pipettes: None,
            }
        }
        AssetClass::FxJpy => {
            // e.g. 154.321 -> big "154", pips "32".
            let (int_part, decimals) = render(price, 3);
            PriceParts {
                big_figure: int_part,
                pips: decimals[0..2].to_string(),
                pipettes: None,
            }
        }
        AssetClass::FxStandard => {
            if digit_count == 3 {
                // e.g. 0.875 -> big "0.8", pips "75".
                let (int_part, decimals) = render(price, 3);
                PriceParts {
                    big_figure: format!("{int_part}.{}", &decimals[0..1]),
                    pips: decimals[1..3].to_string(),
                    pipettes: None,
                }
            } else {
                // e.g. 1.08567 -> big "1.08", pips "56", pipettes "7".
                let (int_part, decimals) = render(price, 5);
                PriceParts {
                    big_figure: format!("{int_part}.{}", &decimals[0..2]),
                    pips: decimals[2..4].to_string(),
                    pipettes: Some(decimals[4..5].to_string()),
                }
            }
        }
        AssetClass::GenericDecimal => {
            let precision = digit_count.min(8);
            if precision >= 2 {
                let (int_part, decimals) = render(price, precision as usize);
                let cut = decimals.len() - 2;
                PriceParts {
                    big_figure: if cut == 0 {
                        int_part
                    } else {
                        format!("{int_part}.{}", &decimals[0..cut])
                    },
                    pips: decimals[cut..].to_string(),
                    pipettes: None,
                }
            } else {
                let (int_part, decimals) = render(price, precision as usize);
                let big = if decimals.is_empty() {
                    int_part
                } else {
                    format!("{int_part}.{decimals}")
                };
                PriceParts {
                    big_figure: big,
                    pips: String::new(),
                    pipettes: None,
                }
            }
        }
    }
}

/// Render a price to `precision` decimals, returning (integer part, decimals).
fn render(price: f64, precision: usize) -> (String, String) {
    let s = format!("{price:.precision$}");
    match s.split_once('.') {
        Some((i, d)) => (i.to_string(), d.to_string()),
        None => (s, String::new()),
    }
}
