use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of a single TCP connect attempt.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub ok: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn connected(latency_ms: u64) -> Self {
        Self { ok: true, latency_ms: Some(latency_ms), error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { ok: false, latency_ms: None, error: Some(error.into()) }
    }
}

/// One entry of a port-check response. `port` echoes the requested value as given.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PortCheckResult {
    pub port: Value,
    pub open: bool,
    pub reason: Option<String>,
}

/// Sequential latency samples against one host:port.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PingReport {
    pub host: String,
    pub port: u16,
    pub values: Vec<Option<u64>>,
    pub note: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PortCheckReport {
    pub host: String,
    pub results: Vec<PortCheckResult>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ReverseDnsResult {
    pub ip: String,
    pub ptr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VendorLookup {
    pub oui: String,
    pub vendor: Option<String>,
}
