//! パース関連のユーティリティ関数

use anyhow::Result;
use std::time::Duration;

/// アドレス文字列をu64にパース
///
/// 16進数（0xプレフィックス付き）または10進数をサポート
///
/// # Examples
/// ```
/// use hashi_core::parse::parse_address;
///
/// assert_eq!(parse_address("0x1234").unwrap(), 0x1234);
/// assert_eq!(parse_address("1234").unwrap(), 1234);
/// ```
pub fn parse_address(s: &str) -> Result<u64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16)
            .map_err(|e| anyhow::anyhow!("Invalid hexadecimal address '{}': {}", s, e)),
        None => s
            .parse::<u64>()
            .map_err(|e| anyhow::anyhow!("Invalid address '{}': {}", s, e)),
    }
}

/// ミリ秒の文字列を `Duration` にパース
pub fn parse_millis(s: &str) -> Result<Duration> {
    let s = s.trim();
    let s = s.strip_suffix("ms").unwrap_or(s);
    s.parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| anyhow::anyhow!("Invalid duration '{}': {}", s, e))
}

/// 16進のバイト列をパース（`"90cc"` や `"90 cc"`）
pub fn parse_hex_bytes(s: &str) -> Result<Vec<u8>> {
    let digits: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    let digits = digits.strip_prefix("0x").unwrap_or(&digits);
    if digits.is_empty() || !digits.is_ascii() || digits.len() % 2 != 0 {
        anyhow::bail!("Invalid byte string '{}': expected an even number of hex digits", s);
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|e| anyhow::anyhow!("Invalid byte string '{}': {}", s, e))
        })
        .collect()
}
