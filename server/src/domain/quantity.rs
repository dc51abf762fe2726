//! Kubernetes-style resource quantities
//!
//! Parses the subset used by workshop templates and node capacity reports:
//! plain numbers, the `m` milli suffix, binary suffixes (`Ki` .. `Ei`) and
//! decimal suffixes (`k`, `K`, `M` .. `E`).

/// Parse a CPU quantity into millicores (`"500m"` -> 500, `"2"` -> 2000)
pub fn parse_cpu_millis(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if let Some(millis) = raw.strip_suffix('m') {
        return millis.parse::<u64>().ok();
    }
    let cores: f64 = raw.parse().ok()?;
    if cores < 0.0 {
        return None;
    }
    Some((cores * 1000.0).round() as u64)
}

/// Parse a memory or storage quantity into bytes (`"1Gi"` -> 1073741824)
pub fn parse_bytes(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);
    let value: f64 = number.parse().ok()?;

    let multiplier: f64 = match suffix {
        "" => 1.0,
        "Ki" => 1024.0,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        "k" | "K" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        _ => return None,
    };

    Some((value * multiplier).round() as u64)
}

/// Docker `NanoCpus` equivalent of a CPU quantity
pub fn cpu_to_nano_cpus(raw: &str) -> Option<i64> {
    parse_cpu_millis(raw).map(|m| (m as i64) * 1_000_000)
}
