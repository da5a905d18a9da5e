//! Geo-data collaborator: resolves one address to location and ASN facts.

use std::collections::BTreeMap;
use std::net::IpAddr;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CountryRecord {
    pub iso_code: String,
    pub geoname_id: u32,
    pub name: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CityRecord {
    pub geoname_id: u32,
    pub name: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LocationRecord {
    pub latitude: f32,
    pub longitude: f32,
    pub metro_code: u32,
}

/// Lookup result for one address. `additional_data` holds the values
/// contributed by lookup-capable extensions and is omitted when empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IpRecord {
    pub country: CountryRecord,
    pub city: CityRecord,
    pub location: LocationRecord,
    pub asn: u32,
    pub org: String,
    pub ip_address: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub additional_data: Vec<Value>,
}

impl IpRecord {
    pub fn for_address(address: IpAddr) -> Self {
        Self {
            ip_address: address.to_string(),
            ..Self::default()
        }
    }
}

pub trait GeoLookup: Send + Sync {
    fn lookup(&self, address: IpAddr) -> Result<IpRecord>;
}

/// Backend used when no geo database is wired in: every record carries
/// only its address.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredGeoLookup;

impl GeoLookup for UnconfiguredGeoLookup {
    fn lookup(&self, address: IpAddr) -> Result<IpRecord> {
        Ok(IpRecord::for_address(address))
    }
}

#[cfg(test)]
mod tests {
    use super::{GeoLookup, IpRecord, UnconfiguredGeoLookup};
    use serde_json::json;

    #[test]
    fn unit_ip_record_omits_empty_additional_data() {
        let record = UnconfiguredGeoLookup
            .lookup("8.8.8.8".parse().expect("ip"))
            .expect("lookup");
        let rendered = serde_json::to_value(&record).expect("serialize");
        assert_eq!(rendered["ip_address"], "8.8.8.8");
        assert_eq!(rendered["asn"], 0);
        assert!(rendered.get("additional_data").is_none());

        let enriched = IpRecord {
            additional_data: vec![json!({ "blocked": true })],
            ..record
        };
        let rendered = serde_json::to_value(&enriched).expect("serialize");
        assert_eq!(rendered["additional_data"], json!([{ "blocked": true }]));
    }
}
