use crossterm::style::Color;
use std::time::Duration;

/// (pod color, container color) pairs.
const PALETTE: [(Color, Color); 6] = [
    (Color::Cyan, Color::DarkCyan),
    (Color::Green, Color::DarkGreen),
    (Color::Magenta, Color::DarkMagenta),
    (Color::Yellow, Color::DarkYellow),
    (Color::Blue, Color::DarkBlue),
    (Color::Red, Color::DarkRed),
];

/// 32-bit FNV-1. Stable across builds, unlike `DefaultHasher`.
fn fnv1_32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in bytes {
        hash = hash.wrapping_mul(0x0100_0193);
        hash ^= u32::from(*b);
    }
    hash
}

/// Pick the pod and container colors for a pod name.
pub fn get_colors(pod_name: &str) -> (Color, Color) {
    let idx = fnv1_32(pod_name.as_bytes()) as usize % PALETTE.len();
    PALETTE[idx]
}

/// Parse a duration such as `48h`, `1h30m`, `15s` or `250ms`. A bare `0`
/// means no duration.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(s).map_err(|e| format!("invalid duration '{}': {}", s, e))
}
