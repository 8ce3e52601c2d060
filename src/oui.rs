//! MAC prefix → vendor lookups backed by a vendor table that is downloaded
//! once per resolver and then kept in memory.
//!
//! The table moves through `Unloaded → Loading → Loaded`. Exactly one fetch
//! runs while `Loading`; every caller that arrives in the meantime waits on
//! the same `watch` channel and gets that fetch's outcome. A failed fetch
//! drops back to `Unloaded` so the next lookup tries again. A loaded table is
//! never refreshed.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::types::VendorLookup;

/// IEEE MA-L registry in CSV form.
pub const DEFAULT_OUI_URL: &str = "https://standards-oui.ieee.org/oui/oui.csv";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OuiError {
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),

    #[error("failed to load vendor table: {0}")]
    Load(String),
}

/// Where the raw vendor table comes from.
#[async_trait]
pub trait OuiSource: Send + Sync {
    async fn fetch(&self) -> Result<String>;
}

pub struct HttpOuiSource {
    client: reqwest::Client,
    url: String,
}

impl HttpOuiSource {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self { client, url: url.into() }
    }
}

#[async_trait]
impl OuiSource for HttpOuiSource {
    async fn fetch(&self) -> Result<String> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("request to {} failed", self.url))?;
        let status = resp.status();
        if !status.is_success() {
            bail!("{} answered {}", self.url, status);
        }
        resp.text().await.context("failed to read vendor table body")
    }
}

/// Immutable prefix → organization map. Keys are always `XX:XX:XX`.
#[derive(Debug, Default)]
pub struct OuiTable {
    entries: HashMap<String, String>,
}

impl OuiTable {
    /// Parse a CSV vendor table. The header row names the columns; the
    /// assignment and organization columns are located by name, falling back
    /// to the IEEE layout (`Registry,Assignment,Organization Name,...`).
    pub fn parse_csv(text: &str) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(text.as_bytes());

        let headers = rdr.headers().context("vendor table has no header row")?.clone();
        let find = |names: &[&str]| {
            headers
                .iter()
                .position(|h| names.iter().any(|n| h.trim().eq_ignore_ascii_case(n)))
        };
        let assignment_col = find(&["Assignment", "Mac Prefix", "oui"]).unwrap_or(1);
        let org_col = find(&["Organization Name", "Vendor Name", "vendor"]).unwrap_or(2);

        let mut entries = HashMap::new();
        for record in rdr.records() {
            let record = record.context("malformed vendor table row")?;
            let (Some(assignment), Some(org)) = (record.get(assignment_col), record.get(org_col))
            else {
                continue;
            };
            let org = org.trim();
            if org.is_empty() {
                continue;
            }
            if let Some(key) = assignment_key(assignment) {
                entries.entry(key).or_insert_with(|| org.to_string());
            }
        }

        if entries.is_empty() {
            bail!("vendor table contained no usable rows");
        }
        Ok(Self { entries })
    }

    pub fn get(&self, prefix: &str) -> Option<&str> {
        self.entries.get(prefix).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `002272`, `00-22-72` or `00:22:72` → `00:22:72`. Longer (MA-M/MA-S) assignments are skipped.
fn assignment_key(raw: &str) -> Option<String> {
    let hex: String = raw
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.' | ' ' | '"'))
        .collect::<String>()
        .to_ascii_uppercase();
    if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(format!("{}:{}:{}", &hex[0..2], &hex[2..4], &hex[4..6]))
}

/// Reduce a MAC address or prefix to its `XX:XX:XX` OUI.
///
/// Accepts colon, hyphen and dotted (`001a.2b3c.4d5e`) notation, bare hex
/// (`001A2B...`) and single-digit groups as printed by some `arp` tools.
pub fn normalize_prefix(mac: &str) -> Result<String, OuiError> {
    let invalid = || OuiError::InvalidMac(mac.to_string());
    let cleaned = mac.trim().to_ascii_uppercase().replace(['-', '.'], ":");
    let raw_groups: Vec<&str> = cleaned.split(':').filter(|g| !g.is_empty()).collect();

    // Bare hex or dotted quads: re-split into octets.
    let groups: Vec<String> = if raw_groups.iter().all(|g| g.len() > 2 && g.len() % 2 == 0) {
        raw_groups
            .iter()
            .flat_map(|g| g.as_bytes().chunks(2))
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect()
    } else {
        raw_groups.iter().map(|g| g.to_string()).collect()
    };

    if groups.len() < 3 {
        return Err(invalid());
    }

    let mut octets = Vec::with_capacity(3);
    for g in &groups[..3] {
        if g.is_empty() || g.len() > 2 || !g.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        octets.push(format!("{g:0>2}"));
    }
    Ok(octets.join(":"))
}

type LoadOutcome = Result<Arc<OuiTable>, OuiError>;

enum LoadState {
    Unloaded,
    Loading(watch::Receiver<Option<LoadOutcome>>),
    Loaded(Arc<OuiTable>),
}

/// Vendor resolver owning its table and loading state.
pub struct OuiResolver {
    source: Arc<dyn OuiSource>,
    state: Mutex<LoadState>,
}

impl OuiResolver {
    pub fn new(source: Arc<dyn OuiSource>) -> Arc<Self> {
        Arc::new(Self { source, state: Mutex::new(LoadState::Unloaded) })
    }

    pub fn is_loaded(&self) -> bool {
        matches!(*self.lock_state(), LoadState::Loaded(_))
    }

    /// Look up the vendor for a MAC address or prefix. Unknown prefixes are
    /// `vendor: None`, not an error. Input is validated before any fetch.
    pub async fn vendor_for(self: &Arc<Self>, mac: &str) -> Result<VendorLookup, OuiError> {
        let oui = normalize_prefix(mac)?;
        let table = self.table().await?;
        let vendor = table.get(&oui).map(str::to_string);
        Ok(VendorLookup { oui, vendor })
    }

    /// Return the loaded table, starting or joining the single in-flight load.
    pub async fn table(self: &Arc<Self>) -> Result<Arc<OuiTable>, OuiError> {
        let mut rx = {
            let mut state = self.lock_state();
            match &*state {
                LoadState::Loaded(table) => return Ok(table.clone()),
                LoadState::Loading(rx) => rx.clone(),
                LoadState::Unloaded => {
                    let (tx, rx) = watch::channel(None);
                    *state = LoadState::Loading(rx.clone());
                    // Spawned so the load finishes even if this caller goes away.
                    tokio::spawn(Arc::clone(self).load(tx));
                    rx
                }
            }
        };

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        match outcome {
            Some(result) => result,
            None => {
                // Loader vanished without reporting; don't leave the state stuck.
                let mut state = self.lock_state();
                if matches!(&*state, LoadState::Loading(cur) if cur.same_channel(&rx)) {
                    *state = LoadState::Unloaded;
                }
                Err(OuiError::Load("vendor table loader stopped unexpectedly".into()))
            }
        }
    }

    async fn load(self: Arc<Self>, tx: watch::Sender<Option<LoadOutcome>>) {
        info!("loading OUI vendor table");
        let outcome = match self.source.fetch().await.and_then(|text| OuiTable::parse_csv(&text)) {
            Ok(table) => {
                info!(entries = table.len(), "OUI vendor table loaded");
                Ok(Arc::new(table))
            }
            Err(e) => {
                warn!("OUI vendor table load failed: {e:#}");
                Err(OuiError::Load(format!("{e:#}")))
            }
        };

        *self.lock_state() = match &outcome {
            Ok(table) => LoadState::Loaded(table.clone()),
            Err(_) => LoadState::Unloaded,
        };
        // No receivers just means nobody is waiting any more.
        let _ = tx.send(Some(outcome));
    }

    fn lock_state(&self) -> MutexGuard<'_, LoadState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const SAMPLE: &str = "Registry,Assignment,Organization Name,Organization Address\n\
MA-L,001A2B,Ayecom Technology Co. Ltd.,Taipei TW\n\
MA-L,F4F5D8,\"Google, Inc.\",\"1600 Amphitheatre Parkway Mountain View CA US 94043\"\n\
MA-L,00000C,Cisco Systems Inc,San Jose CA\n";

    struct CountingSource {
        calls: AtomicUsize,
        fail_first: usize,
        delay: Duration,
    }

    impl CountingSource {
        fn new(fail_first: usize, delay: Duration) -> Arc<Self> {
            Arc::new(Self { calls: AtomicUsize::new(0), fail_first, delay })
        }
    }

    #[async_trait]
    impl OuiSource for CountingSource {
        async fn fetch(&self) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if n < self.fail_first {
                bail!("upstream answered 503");
            }
            Ok(SAMPLE.to_string())
        }
    }

    #[test]
    fn parse_ieee_csv_with_quoting() {
        let table = OuiTable::parse_csv(SAMPLE).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.get("00:1A:2B"), Some("Ayecom Technology Co. Ltd."));
        assert_eq!(table.get("F4:F5:D8"), Some("Google, Inc."));
    }

    #[test]
    fn parse_prefix_style_headers() {
        let text = "Mac Prefix,Vendor Name,Private\n00-50-56,VMware Inc,false\n";
        let table = OuiTable::parse_csv(text).unwrap();
        assert_eq!(table.get("00:50:56"), Some("VMware Inc"));
    }

    #[test]
    fn empty_table_is_an_error() {
        assert!(OuiTable::parse_csv("Registry,Assignment,Organization Name\n").is_err());
    }

    #[test]
    fn normalize_accepts_common_notations() {
        assert_eq!(normalize_prefix("00:1a:2b:3c:4d:5e").unwrap(), "00:1A:2B");
        assert_eq!(normalize_prefix("00-1A-2B-3C-4D-5E").unwrap(), "00:1A:2B");
        assert_eq!(normalize_prefix("001a.2b3c.4d5e").unwrap(), "00:1A:2B");
        assert_eq!(normalize_prefix("001A2B3C4D5E").unwrap(), "00:1A:2B");
        assert_eq!(normalize_prefix("0:1a:2b:3:4:5").unwrap(), "00:1A:2B");
        assert_eq!(normalize_prefix(" ff:ff:ff ").unwrap(), "FF:FF:FF");
    }

    #[test]
    fn normalize_rejects_short_or_garbage() {
        assert!(normalize_prefix("00:1A").is_err());
        assert!(normalize_prefix("").is_err());
        assert!(normalize_prefix("zz:zz:zz").is_err());
        assert!(normalize_prefix("001:1A:2B").is_err());
    }

    #[tokio::test]
    async fn concurrent_lookups_share_one_fetch() {
        let source = CountingSource::new(0, Duration::from_millis(50));
        let resolver = OuiResolver::new(source.clone());

        let lookups = (0..8).map(|_| {
            let r = resolver.clone();
            tokio::spawn(async move { r.vendor_for("00:1A:2B:00:00:01").await })
        });
        for handle in lookups.collect::<Vec<_>>() {
            let res = handle.await.unwrap().unwrap();
            assert_eq!(res.vendor.as_deref(), Some("Ayecom Technology Co. Ltd."));
        }

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(resolver.is_loaded());

        resolver.vendor_for("00:00:0C:11:22:33").await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_prefix_is_null_vendor() {
        let resolver = OuiResolver::new(CountingSource::new(0, Duration::ZERO));
        let res = resolver.vendor_for("FF:FF:FF").await.unwrap();
        assert_eq!(res, VendorLookup { oui: "FF:FF:FF".into(), vendor: None });
    }

    #[tokio::test]
    async fn invalid_mac_does_not_fetch() {
        let source = CountingSource::new(0, Duration::ZERO);
        let resolver = OuiResolver::new(source.clone());
        let err = resolver.vendor_for("00:1A").await.unwrap_err();
        assert!(matches!(err, OuiError::InvalidMac(_)));
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_load_resets_and_retries() {
        let source = CountingSource::new(1, Duration::from_millis(20));
        let resolver = OuiResolver::new(source.clone());

        let (a, b) = tokio::join!(
            resolver.vendor_for("00:1A:2B"),
            resolver.vendor_for("00:00:0C")
        );
        assert!(matches!(a, Err(OuiError::Load(_))));
        assert!(matches!(b, Err(OuiError::Load(_))));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(!resolver.is_loaded());

        let res = resolver.vendor_for("00:00:0C").await.unwrap();
        assert_eq!(res.vendor.as_deref(), Some("Cisco Systems Inc"));
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }
}
