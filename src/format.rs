//! Human-readable currency formatting
//!
//! Presentation only; aggregated values are never altered.

struct Tier {
    threshold: f64,
    divisor: f64,
    suffix: &'static str,
}

/// Ascending. The K tier starts at ten thousand, not one thousand.
const TIERS: &[Tier] = &[
    Tier { threshold: 0.0, divisor: 1.0, suffix: "" },
    Tier { threshold: 1e4, divisor: 1e3, suffix: "K" },
    Tier { threshold: 1e6, divisor: 1e6, suffix: "M" },
    Tier { threshold: 1e9, divisor: 1e9, suffix: "B" },
];

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Format a currency magnitude: `$89.59B`, `$125.50M`, `$15.20K`, `$5,432.50`.
///
/// A value whose rounding reaches the next tier is promoted, so
/// `9999.999` renders as `$10.00K`.
pub fn format_currency(value: f64) -> String {
    if !value.is_finite() {
        return "N/A".to_string();
    }
    if value < 0.0 {
        return format!("-{}", format_currency(-value));
    }

    let mut index = TIERS
        .iter()
        .rposition(|tier| value >= tier.threshold)
        .unwrap_or(0);
    let mut scaled = round2(value / TIERS[index].divisor);
    while let Some(next) = TIERS.get(index + 1) {
        if scaled * TIERS[index].divisor < next.threshold {
            break;
        }
        index += 1;
        scaled = round2(value / next.divisor);
    }

    let tier = &TIERS[index];
    if tier.suffix.is_empty() {
        format!("${}", group_thousands(&format!("{:.2}", scaled)))
    } else {
        format!("${:.2}{}", scaled, tier.suffix)
    }
}

/// Whole-number counts with thousands separators.
pub fn format_count(count: u64) -> String {
    group_thousands(&count.to_string())
}

fn group_thousands(number: &str) -> String {
    let (integer, fraction) = match number.split_once('.') {
        Some((integer, fraction)) => (integer, Some(fraction)),
        None => (number, None),
    };
    let digits = integer.len();
    let mut out = String::with_capacity(number.len() + digits / 3);
    for (i, c) in integer.chars().enumerate() {
        if i > 0 && (digits - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    if let Some(fraction) = fraction {
        out.push('.');
        out.push_str(fraction);
    }
    out
}
