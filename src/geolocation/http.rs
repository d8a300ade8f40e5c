//! HTTP geolocation provider (ipplus360 street/biz API)

use super::{join_location, Enrichment, GeoLookup, LookupError};
use crate::config::HttpLookupConfig;
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, USER_AGENT};
use serde::Deserialize;
use std::time::Duration;

const CLIENT_USER_AGENT: &str = concat!("iplog/", env!("CARGO_PKG_VERSION"));
const SUCCESS_CODE: &str = "Success";

#[derive(Debug, Deserialize)]
struct ApiResponse {
    code: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    data: Option<ApiData>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiData {
    country: Option<String>,
    prov: Option<String>,
    city: Option<String>,
    isp: Option<String>,
}

/// Looks addresses up against a remote HTTP service
pub struct HttpGeoLookup {
    client: Client,
    url: String,
    key: String,
}

impl HttpGeoLookup {
    /// Create a provider with the configured endpoint, key and timeout
    pub fn new(config: &HttpLookupConfig) -> Result<Self, LookupError> {
        let timeout = Duration::from_millis(config.timeout_ms);
        let client = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;

        Ok(HttpGeoLookup {
            client,
            url: config.url.clone(),
            key: config.key.clone(),
        })
    }

    /// Decode a provider response body into an [`Enrichment`]
    pub fn parse_response(body: &str) -> Result<Enrichment, LookupError> {
        let response: ApiResponse = serde_json::from_str(body)?;

        match response.code.as_deref() {
            Some(SUCCESS_CODE) | None => {}
            Some(code) => {
                return Err(LookupError::Provider {
                    code: code.to_string(),
                    msg: response.msg.unwrap_or_default(),
                });
            }
        }

        let data = response.data.ok_or(LookupError::NoData)?;
        let enrichment = Enrichment {
            location: join_location([
                data.country.as_deref(),
                data.prov.as_deref(),
                data.city.as_deref(),
            ]),
            isp: data.isp.filter(|isp| !isp.trim().is_empty()),
        };

        if enrichment.is_empty() {
            return Err(LookupError::NoData);
        }
        Ok(enrichment)
    }
}

impl GeoLookup for HttpGeoLookup {
    fn lookup(&self, address: &str) -> Result<Enrichment, LookupError> {
        log::debug!("Querying geolocation provider for {}", address);

        let response = self
            .client
            .get(&self.url)
            .query(&[
                ("key", self.key.as_str()),
                ("ip", address),
                ("coordsys", "WGS84"),
                ("area", "multi"),
            ])
            .header(USER_AGENT, CLIENT_USER_AGENT)
            .header(ACCEPT, "application/json")
            .send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(LookupError::Status(status.as_u16()));
        }

        let body = response.text()?;
        Self::parse_response(&body)
    }
}
