//! Asset-graph support: fingerprinting for dedup, target filtering, and
//! bulk import fan-out.

pub mod filter;
pub mod fingerprint;
pub mod import;

pub use filter::ScanFilter;
pub use fingerprint::{
    aggregation_key, fingerprint_hash, normalize_url, subdomain_fingerprint, url_fingerprint,
    vuln_fingerprint,
};
pub use import::{ImportOutcome, import_assets};
