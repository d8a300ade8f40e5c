//! Offline geolocation using MaxMind GeoLite2 databases
//!
//! The City database supplies the location string. The ASN database is
//! optional and supplies the ISP name from the network's registered
//! organisation. Both files must be downloaded separately from MaxMind
//! (free with registration).

use super::{join_location, Enrichment, GeoLookup, LookupError};
use maxminddb::{geoip2, MaxMindDBError, Reader};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

/// GeoIP lookup service backed by local `.mmdb` files
pub struct MaxMindGeoLookup {
    city: Arc<Reader<Vec<u8>>>,
    asn: Option<Arc<Reader<Vec<u8>>>>,
}

impl MaxMindGeoLookup {
    /// Open the City database and, if given, the ASN database
    ///
    /// # Errors
    ///
    /// Returns an error if either file is missing or is not a valid database.
    pub fn new<P: AsRef<Path>>(city_db: P, asn_db: Option<P>) -> Result<Self, LookupError> {
        let city = Self::open(city_db.as_ref())?;
        let asn = match asn_db {
            Some(path) => Some(Self::open(path.as_ref())?),
            None => None,
        };

        Ok(MaxMindGeoLookup { city, asn })
    }

    fn open(path: &Path) -> Result<Arc<Reader<Vec<u8>>>, LookupError> {
        if !path.exists() {
            return Err(LookupError::FileNotFound(path.display().to_string()));
        }
        Ok(Arc::new(Reader::open_readfile(path)?))
    }

    fn lookup_location(&self, ip: IpAddr) -> Result<Option<String>, LookupError> {
        let city: geoip2::City = match self.city.lookup(ip) {
            Ok(city) => city,
            Err(MaxMindDBError::AddressNotFoundError(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let country = city.country.and_then(|c| english(c.names));
        let subdivision = city
            .subdivisions
            .and_then(|s| s.into_iter().next())
            .and_then(|s| english(s.names));
        let city_name = city.city.and_then(|c| english(c.names));

        Ok(join_location([country, subdivision, city_name]))
    }

    fn lookup_isp(&self, ip: IpAddr) -> Result<Option<String>, LookupError> {
        let Some(reader) = &self.asn else {
            return Ok(None);
        };

        match reader.lookup::<geoip2::Asn>(ip) {
            Ok(asn) => Ok(asn.autonomous_system_organization.map(String::from)),
            Err(MaxMindDBError::AddressNotFoundError(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn english<'a>(names: Option<BTreeMap<&'a str, &'a str>>) -> Option<&'a str> {
    names.and_then(|n| n.get("en").copied())
}

impl Clone for MaxMindGeoLookup {
    fn clone(&self) -> Self {
        MaxMindGeoLookup {
            city: Arc::clone(&self.city),
            asn: self.asn.as_ref().map(Arc::clone),
        }
    }
}

impl GeoLookup for MaxMindGeoLookup {
    fn lookup(&self, address: &str) -> Result<Enrichment, LookupError> {
        let ip: IpAddr = address
            .parse()
            .map_err(|_| LookupError::InvalidAddress(address.to_string()))?;

        let enrichment = Enrichment {
            location: self.lookup_location(ip)?,
            isp: self.lookup_isp(ip)?,
        };

        if enrichment.is_empty() {
            return Err(LookupError::NoData);
        }
        Ok(enrichment)
    }
}
