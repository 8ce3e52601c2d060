//! PTR lookups through the platform resolver.
//!
//! A missing PTR record is an expected answer, so every outcome here is a
//! [`ReverseDnsResult`]; only the error code distinguishes the failure kind.

use crate::types::ReverseDnsResult;
use std::io;
use std::net::IpAddr;
use tracing::warn;

pub const ERR_INVALID: &str = "EINVAL";
pub const ERR_NOT_FOUND: &str = "ENOTFOUND";
pub const ERR_SERVFAIL: &str = "ESERVFAIL";

/// Resolve the PTR name for `ip`. `getnameinfo` blocks, so it runs on the blocking pool.
pub async fn reverse_lookup(ip: &str) -> ReverseDnsResult {
    let ip = ip.trim().to_string();
    let addr: IpAddr = match ip.parse() {
        Ok(a) => a,
        Err(_) => return failure(ip, ERR_INVALID),
    };

    let outcome = tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&addr))
        .await
        .unwrap_or_else(|e| Err(io::Error::other(e)));
    classify(ip, addr, outcome)
}

/// Map a raw resolver outcome to a result. `getnameinfo` echoes the numeric
/// address back when there is no PTR record, which counts as not found.
pub fn classify(ip: String, addr: IpAddr, outcome: io::Result<String>) -> ReverseDnsResult {
    match outcome {
        Ok(name) => {
            let name = name.trim_end_matches('.').to_string();
            if name.is_empty() || name.parse::<IpAddr>().map(|n| n == addr).unwrap_or(false) {
                failure(ip, ERR_NOT_FOUND)
            } else {
                ReverseDnsResult { ip, ptr: Some(name), error: None }
            }
        }
        Err(e) if is_no_name(&e) => failure(ip, ERR_NOT_FOUND),
        Err(e) => {
            warn!(%ip, error = %e, "reverse lookup failed");
            failure(ip, ERR_SERVFAIL)
        }
    }
}

fn is_no_name(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::NotFound {
        return true;
    }
    let msg = e.to_string().to_lowercase();
    msg.contains("not known") || msg.contains("no address") || msg.contains("not found")
}

fn failure(ip: String, code: &str) -> ReverseDnsResult {
    ReverseDnsResult { ip, ptr: None, error: Some(code.to_string()) }
}
