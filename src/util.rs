macro_rules! time_info {
    ($name:expr, $f:block) => {{
        let start = std::time::Instant::now();
        let result = $f;
        let end = std::time::Instant::now();
        log::info!("{} (took {:?})", $name, end.duration_since(start));
        result
    }};
}

macro_rules! time_debug {
    ($name:expr, $f:block) => {{
        let start = std::time::Instant::now();
        let result = $f;
        let end = std::time::Instant::now();
        log::debug!("{} (took {:?})", $name, end.duration_since(start));
        result
    }};
}

use crate::word::U256;

/// Parses a 256-bit literal given either in decimal or as `0x`-prefixed hex.
pub fn parse_u256(s: &str) -> Option<U256> {
    let s = s.trim();

    if let Some(digits) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        if digits.is_empty() {
            None
        } else {
            U256::from_str_radix(digits, 16).ok()
        }
    } else {
        s.parse::<U256>().ok()
    }
}

/// Formats a word as exact, full width hex literal (`0x` + 64 digits).
pub fn format_u256(v: U256) -> String {
    format!("0x{}", hex::encode(v.to_be_bytes()))
}
