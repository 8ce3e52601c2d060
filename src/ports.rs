use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::fs;
use std::path::Path;

/// Upper bound on the number of ports accepted by a single port-check request.
pub const MAX_PORTS_PER_REQUEST: usize = 50;

/// Interpret one JSON port value from a port-check request.
///
/// Only integral numbers in 1..=65535 are accepted; `443.0` counts as 443.
/// Strings, fractional or negative numbers and anything else map to `None`
/// and are reported back as invalid.
pub fn parse_port_value(v: &Value) -> Option<u16> {
    let n = v.as_u64().or_else(|| {
        v.as_f64()
            .filter(|f| f.fract() == 0.0 && (1.0..=65535.0).contains(f))
            .map(|f| f as u64)
    })?;
    if n == 0 || n > 65535 {
        return None;
    }
    Some(n as u16)
}

/// Parse a textual port list into a deduplicated list of TCP ports (1..=65535).
///
/// Entries are separated by newlines or commas. Supported entry formats:
/// - single port number: `80`
/// - inclusive range: `8000-8010`
/// - comments: everything after `#` on a line is ignored
pub fn parse_ports_str(s: &str) -> Result<Vec<u16>> {
    let mut out: Vec<u16> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.split('#').next().unwrap_or("");

        for entry in line.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            if let Some((a, b)) = entry.split_once('-') {
                let start = parse_port_str(a.trim())
                    .with_context(|| format!("line {line_no}: invalid start in range: {a}"))?;
                let end = parse_port_str(b.trim())
                    .with_context(|| format!("line {line_no}: invalid end in range: {b}"))?;
                if start > end {
                    bail!("line {line_no}: invalid range {start}-{end} (start > end)");
                }
                for p in start..=end {
                    if seen.insert(p) {
                        out.push(p);
                    }
                }
                continue;
            }

            let p = parse_port_str(entry)
                .with_context(|| format!("line {line_no}: invalid port value: {entry}"))?;
            if seen.insert(p) {
                out.push(p);
            }
        }
    }

    Ok(out)
}

/// Load a ports list from a file path.
pub fn load_ports_from_path(path: impl AsRef<Path>) -> Result<Vec<u16>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read ports file: {}", path.as_ref().display()))?;
    parse_ports_str(&content)
}

/// Ports checked by the CLI when none are given.
pub fn default_ports() -> Vec<u16> {
    const DEFAULT: &[u16] = &[
        21, 22, 23, 25, 53, 80, 110, 143, 443, 445, 587, 993, 995, 3000, 3306, 3389, 5432, 5900,
        6379, 8000, 8080, 8443, 9000, 27017,
    ];
    DEFAULT.to_vec()
}

fn parse_port_str(s: &str) -> Result<u16> {
    let val: u32 = s.parse::<u32>().map_err(|e| anyhow::anyhow!(e))?;
    if val == 0 || val > 65535 {
        bail!("port out of range: {val}");
    }
    Ok(val as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_port_values() {
        assert_eq!(parse_port_value(&json!(80)), Some(80));
        assert_eq!(parse_port_value(&json!(65535)), Some(65535));
        assert_eq!(parse_port_value(&json!(0)), None);
        assert_eq!(parse_port_value(&json!(99999)), None);
        assert_eq!(parse_port_value(&json!(-1)), None);
        assert_eq!(parse_port_value(&json!(80.0)), Some(80));
        assert_eq!(parse_port_value(&json!(80.5)), None);
        assert_eq!(parse_port_value(&json!(70000.0)), None);
        assert_eq!(parse_port_value(&json!("80")), None);
        assert_eq!(parse_port_value(&json!("abc")), None);
        assert_eq!(parse_port_value(&Value::Null), None);
    }

    #[test]
    fn parse_comma_separated() {
        let ports = parse_ports_str("22, 80,443").unwrap();
        assert_eq!(ports, vec![22, 80, 443]);
    }

    #[test]
    fn parse_ranges_and_dedup() {
        let input = "8000-8002\n80\n8001\n";
        let ports = parse_ports_str(input).unwrap();
        assert_eq!(ports, vec![8000, 8001, 8002, 80]);
    }

    #[test]
    fn reversed_range_errors() {
        assert!(parse_ports_str("90-80").is_err());
    }

    #[test]
    fn invalid_values_error() {
        assert!(parse_ports_str("70000\n").is_err());
        assert!(parse_ports_str("http").is_err());
    }

    #[test]
    fn default_fits_in_one_request() {
        let d = default_ports();
        assert!(d.len() <= MAX_PORTS_PER_REQUEST);
        assert!(d.contains(&80) && d.contains(&443));
    }
}
