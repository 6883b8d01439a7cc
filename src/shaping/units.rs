//! Rate strings in `tc` grammar
//!
//! Only the API layer and the sampler look at magnitudes; the translator
//! passes rate strings through untouched.

/// Parse a `tc` rate such as `20mbit`, `1Gbit`, `500kbps` into bits per second.
///
/// Suffixes follow `tc`: `bit` units are bits, `bps` units are bytes. A bare
/// number is bits per second. Returns `None` for anything else.
pub fn parse_rate(input: &str) -> Option<u64> {
    let s = input.trim().to_ascii_lowercase();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    if number.is_empty() {
        return None;
    }
    let value: f64 = number.parse().ok()?;

    let multiplier: f64 = match unit {
        "" | "bit" => 1.0,
        "kbit" => 1e3,
        "mbit" => 1e6,
        "gbit" => 1e9,
        "tbit" => 1e12,
        "bps" => 8.0,
        "kbps" => 8e3,
        "mbps" => 8e6,
        "gbps" => 8e9,
        "tbps" => 8e12,
        _ => return None,
    };

    let bits = value * multiplier;
    if bits.is_finite() && bits >= 0.0 {
        Some(bits.round() as u64)
    } else {
        None
    }
}

/// Bits per second as Mbit/s
pub fn to_mbps(bits_per_sec: u64) -> f64 {
    bits_per_sec as f64 / 1_000_000.0
}

/// Round to two decimals for display
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
