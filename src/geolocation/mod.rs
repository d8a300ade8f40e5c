//! Address geolocation providers
//!
//! The tracker only needs a location string and an ISP name for a newly
//! seen address. Providers implement [`GeoLookup`]; any failure is reported
//! as a [`LookupError`] and the caller records the address without
//! enrichment.

pub mod http;
pub mod maxmind;

pub use http::HttpGeoLookup;
pub use maxmind::MaxMindGeoLookup;

use crate::config::{LookupConfig, LookupProvider};
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during a geolocation lookup
#[derive(Error, Debug)]
pub enum LookupError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned HTTP status {0}")]
    Status(u16),

    #[error("provider error {code}: {msg}")]
    Provider { code: String, msg: String },

    #[error("malformed provider response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("no location data for address")]
    NoData,

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("GeoIP database error: {0}")]
    Database(#[from] maxminddb::MaxMindDBError),

    #[error("database file not found: {0}")]
    FileNotFound(String),
}

/// Metadata obtained for an address
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Enrichment {
    pub location: Option<String>,
    pub isp: Option<String>,
}

impl Enrichment {
    pub fn is_empty(&self) -> bool {
        self.location.is_none() && self.isp.is_none()
    }
}

/// A best-effort, single-attempt address lookup
pub trait GeoLookup: Send + Sync {
    fn lookup(&self, address: &str) -> Result<Enrichment, LookupError>;
}

/// Build the provider selected in the configuration
///
/// Returns `Ok(None)` when lookups are turned off.
pub fn from_config(config: &LookupConfig) -> Result<Option<Arc<dyn GeoLookup>>, LookupError> {
    match config.provider {
        LookupProvider::None => Ok(None),
        LookupProvider::Http => {
            let provider = HttpGeoLookup::new(&config.http)?;
            Ok(Some(Arc::new(provider)))
        }
        LookupProvider::Maxmind => {
            let provider = MaxMindGeoLookup::new(
                config.maxmind.city_db.as_path(),
                config.maxmind.asn_db.as_deref(),
            )?;
            Ok(Some(Arc::new(provider)))
        }
    }
}

/// Join the non-empty parts of a place name with single spaces
pub(crate) fn join_location<'a, I>(parts: I) -> Option<String>
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    let joined = parts
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}
