//! Conversions between Kubernetes resource quantities and plain numbers.
//!
//! CPU is normalized to millicores and memory to bytes. The lenient
//! `parse_*` functions return `0.0` for absent or malformed input; the
//! `try_parse_*` variants return `None` instead so callers that must tell
//! "unknown" apart from an explicit zero can do so.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, PodSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::Serialize;

const BINARY_UNITS: [&str; 6] = ["Ki", "Mi", "Gi", "Ti", "Pi", "Ei"];
const DECIMAL_UNITS: [&str; 6] = ["K", "M", "G", "T", "P", "E"];

/// Splits `"250Mi"` into `(250.0, "Mi")`. A trailing decimal exponent
/// (`"1e3"`) is folded into the number.
fn split_quantity(raw: &str) -> Option<(f64, &str)> {
    let raw = raw.trim();
    let idx = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(idx);
    if number.is_empty() {
        return None;
    }
    let mut value: f64 = number.parse().ok()?;

    let mut unit = unit;
    if unit.len() > 1 && (unit.starts_with('e') || unit.starts_with('E')) {
        if let Ok(exp) = unit[1..].parse::<i32>() {
            value *= 10f64.powi(exp);
            unit = "";
        }
    }

    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value, unit))
}

/// Millicores for a CPU quantity, or `None` when it cannot be read.
pub fn try_parse_cpu(raw: &str) -> Option<f64> {
    let (value, unit) = split_quantity(raw)?;
    let millis = match unit {
        "n" => value / 1e6,
        "u" => value / 1e3,
        "m" => value,
        "" => value * 1000.0,
        _ => return None,
    };
    Some(millis)
}

/// Millicores for a CPU quantity; `0.0` when absent or malformed.
pub fn parse_cpu(raw: Option<&str>) -> f64 {
    raw.and_then(try_parse_cpu).unwrap_or(0.0)
}

/// Bytes for a memory quantity, or `None` when it cannot be read.
pub fn try_parse_memory(raw: &str) -> Option<f64> {
    let (value, unit) = split_quantity(raw)?;
    if unit.is_empty() {
        return Some(value);
    }
    if let Some(pos) = BINARY_UNITS.iter().position(|u| *u == unit) {
        return Some(value * 1024f64.powi(pos as i32 + 1));
    }
    // lowercase "k" is the canonical kilo suffix in quantity notation
    let unit = if unit == "k" { "K" } else { unit };
    DECIMAL_UNITS
        .iter()
        .position(|u| *u == unit)
        .map(|pos| value * 1000f64.powi(pos as i32 + 1))
}

/// Bytes for a memory quantity; `0.0` when absent or malformed.
pub fn parse_memory(raw: &str) -> f64 {
    try_parse_memory(raw).unwrap_or(0.0)
}

/// Renders `value` with at most two decimals, dropping trailing zeros.
fn two_decimals(value: f64) -> String {
    let rendered = format!("{value:.2}");
    rendered
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

pub fn format_cpu(millicores: f64) -> String {
    let millicores = millicores.round();
    if millicores >= 1000.0 {
        two_decimals(millicores / 1000.0)
    } else {
        format!("{millicores}m")
    }
}

/// `value` as it reads after rounding to two decimals.
fn rounded(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// The unit is picked after rounding, so values just under a boundary
/// render as `1Mi` rather than `1024Ki`.
pub fn format_memory(bytes: f64) -> String {
    if bytes.round() < 1024.0 {
        return format!("{}B", bytes.round());
    }
    let mut unit = 0;
    let mut scaled = bytes / 1024.0;
    while unit + 1 < BINARY_UNITS.len() && rounded(scaled) >= 1024.0 {
        unit += 1;
        scaled /= 1024.0;
    }
    format!("{}{}", two_decimals(scaled), BINARY_UNITS[unit])
}

/// CPU and memory amounts in normalized units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    pub cpu_millicores: f64,
    pub memory_bytes: f64,
}

impl Resources {
    pub fn from_map(map: Option<&BTreeMap<String, Quantity>>) -> Self {
        let get = |key: &str| map.and_then(|m| m.get(key)).map(|q| q.0.as_str());
        Resources {
            cpu_millicores: parse_cpu(get("cpu")),
            memory_bytes: get("memory").map(parse_memory).unwrap_or(0.0),
        }
    }

    fn add(self, other: Resources) -> Self {
        Resources {
            cpu_millicores: self.cpu_millicores + other.cpu_millicores,
            memory_bytes: self.memory_bytes + other.memory_bytes,
        }
    }

    fn max(self, other: Resources) -> Self {
        Resources {
            cpu_millicores: self.cpu_millicores.max(other.cpu_millicores),
            memory_bytes: self.memory_bytes.max(other.memory_bytes),
        }
    }
}

fn container_requests(container: &Container) -> Resources {
    Resources::from_map(container.resources.as_ref().and_then(|r| r.requests.as_ref()))
}

/// The request the scheduler accounts for a pod.
///
/// Regular containers run together so their requests add up; init
/// containers run one at a time so only the largest counts. Pod overhead is
/// added on top.
pub fn pod_requests(spec: &PodSpec) -> Resources {
    let regular = spec
        .containers
        .iter()
        .map(container_requests)
        .fold(Resources::default(), Resources::add);
    let init = spec
        .init_containers
        .iter()
        .flatten()
        .map(container_requests)
        .fold(Resources::default(), Resources::max);
    let overhead = Resources::from_map(spec.overhead.as_ref());

    regular.max(init).add(overhead)
}
