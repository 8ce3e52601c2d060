//! DNS record publishing through the Cloudflare v4 API.
//!
//! Without credentials the feature reports itself as not configured (501)
//! rather than failing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use tracing::{info, warn};

use crate::error::{ApiError, ApiResult};

pub const CLOUDFLARE_API_BASE: &str = "https://api.cloudflare.com/client/v4";

/// Record as submitted by the client; every field is checked by [`validate`].
#[derive(Debug, Default, Clone, Deserialize)]
pub struct DnsRecordInput {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub record_type: Option<String>,
    pub value: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecordType {
    A,
    #[serde(rename = "AAAA")]
    Aaaa,
    #[serde(rename = "CNAME")]
    Cname,
    #[serde(rename = "TXT")]
    Txt,
}

impl RecordType {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Some(Self::A),
            "AAAA" => Some(Self::Aaaa),
            "CNAME" => Some(Self::Cname),
            "TXT" => Some(Self::Txt),
            _ => None,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::A => "A",
            Self::Aaaa => "AAAA",
            Self::Cname => "CNAME",
            Self::Txt => "TXT",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub record_type: RecordType,
    pub value: String,
}

/// Check a submitted record. Missing fields, unsupported types and address
/// values of the wrong family are client errors.
pub fn validate(input: Option<DnsRecordInput>) -> ApiResult<DnsRecord> {
    let input = input.ok_or_else(|| ApiError::BadRequest("record is required".into()))?;
    let field = |v: Option<String>, what: &str| {
        v.map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ApiError::BadRequest(format!("record.{what} is required")))
    };
    let name = field(input.name, "name")?;
    let raw_type = field(input.record_type, "type")?;
    let value = field(input.value, "value")?;

    let record_type = RecordType::parse(&raw_type).ok_or_else(|| {
        ApiError::BadRequest(format!("unsupported record type: {raw_type} (use A, AAAA, CNAME or TXT)"))
    })?;
    match record_type {
        RecordType::A if value.parse::<Ipv4Addr>().is_err() => {
            return Err(ApiError::BadRequest("A record value must be an IPv4 address".into()));
        }
        RecordType::Aaaa if value.parse::<Ipv6Addr>().is_err() => {
            return Err(ApiError::BadRequest("AAAA record value must be an IPv6 address".into()));
        }
        _ => {}
    }

    Ok(DnsRecord { name, record_type, value })
}

#[derive(Debug, Clone)]
pub struct CloudflareCredentials {
    pub api_token: String,
    pub zone_id: String,
}

impl CloudflareCredentials {
    /// Both values must be present and non-empty.
    pub fn from_parts(token: Option<String>, zone: Option<String>) -> Option<Self> {
        let token = token.filter(|t| !t.trim().is_empty())?;
        let zone = zone.filter(|z| !z.trim().is_empty())?;
        Some(Self { api_token: token, zone_id: zone })
    }
}

#[derive(Serialize)]
struct CreateRecord<'a> {
    #[serde(rename = "type")]
    record_type: RecordType,
    name: &'a str,
    content: &'a str,
    ttl: u32,
}

pub struct DnsPublisher {
    client: reqwest::Client,
    credentials: Option<CloudflareCredentials>,
    api_base: String,
}

impl DnsPublisher {
    pub fn new(
        client: reqwest::Client,
        credentials: Option<CloudflareCredentials>,
        api_base: impl Into<String>,
    ) -> Self {
        Self { client, credentials, api_base: api_base.into() }
    }

    pub fn is_configured(&self) -> bool {
        self.credentials.is_some()
    }

    /// Create `record` in the configured zone and return a human-readable message.
    pub async fn publish(&self, record: &DnsRecord) -> ApiResult<String> {
        let creds = self
            .credentials
            .as_ref()
            .ok_or_else(|| ApiError::NotConfigured("DNS publishing is not configured".into()))?;

        let url = format!(
            "{}/zones/{}/dns_records",
            self.api_base.trim_end_matches('/'),
            creds.zone_id
        );
        let body = CreateRecord {
            record_type: record.record_type,
            name: &record.name,
            content: &record.value,
            ttl: 1,
        };

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&creds.api_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "DNS provider request failed");
                if e.is_timeout() {
                    ApiError::GatewayTimeout("DNS provider timed out".into())
                } else {
                    ApiError::bad_gateway("failed to reach DNS provider", e.to_string())
                }
            })?;

        let status = resp.status();
        let payload: Value = resp.json().await.unwrap_or(Value::Null);
        let accepted = payload.get("success").and_then(Value::as_bool).unwrap_or(false);

        if !status.is_success() || !accepted {
            let details = payload
                .get("errors")
                .map(Value::to_string)
                .unwrap_or_else(|| payload.to_string());
            warn!(%status, %details, "DNS provider rejected record");
            return Err(ApiError::upstream(
                status.as_u16(),
                "DNS provider rejected the record",
                Some(details),
            ));
        }

        info!(name = %record.name, record_type = %record.record_type, "published DNS record");
        Ok(format!("Published {} record {} -> {}", record.record_type, record.name, record.value))
    }
}
