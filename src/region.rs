//! Node regions.
//!
//! Players are best served by a node close to the voice server they play on.
//! When a node connects, its host is located and matched to the nearest
//! voice region. Nodes listed in the configuration's `known_nodes` table skip
//! the lookup.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::{config::KnownNode, error::Result, protocol};

/// A voice region and where it is.
#[derive(Clone, Debug, PartialEq)]
pub struct Region {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl Region {
    const UNKNOWN: &'static str = "unknown";

    /// The region of nodes that could not be located.
    #[must_use]
    pub fn unknown() -> Self {
        Self {
            name: Self::UNKNOWN.to_owned(),
            latitude: 0.0,
            longitude: 0.0,
        }
    }

    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.name == Self::UNKNOWN
    }

    /// Great-circle distance in kilometers.
    #[must_use]
    pub fn distance_to(&self, latitude: f64, longitude: f64) -> f64 {
        const EARTH_RADIUS_KM: f64 = 6371.0;

        let (lat1, lat2) = (self.latitude.to_radians(), latitude.to_radians());
        let d_lat = lat2 - lat1;
        let d_lon = (longitude - self.longitude).to_radians();

        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
    }
}

impl From<&KnownNode> for Region {
    fn from(node: &KnownNode) -> Self {
        Self {
            name: node.region.clone(),
            latitude: node.latitude,
            longitude: node.longitude,
        }
    }
}

/// Voice regions and the approximate location of their servers.
const VOICE_REGIONS: [(&str, f64, f64); 13] = [
    ("us_west", 37.7749, -122.4194),
    ("us_central", 41.8781, -93.0977),
    ("us_south", 32.7767, -96.7970),
    ("us_east", 39.0438, -77.4874),
    ("brazil", -23.5505, -46.6333),
    ("southafrica", -26.2041, 28.0473),
    ("europe", 50.1109, 8.6821),
    ("russia", 55.7558, 37.6173),
    ("india", 19.0760, 72.8777),
    ("singapore", 1.3521, 103.8198),
    ("hongkong", 22.3193, 114.1694),
    ("japan", 35.6762, 139.6503),
    ("sydney", -33.8688, 151.2093),
];

/// Finds the voice region closest to a location.
#[must_use]
pub fn closest_region(latitude: f64, longitude: f64) -> Region {
    VOICE_REGIONS
        .iter()
        .map(|&(name, lat, lon)| Region {
            name: name.to_owned(),
            latitude: lat,
            longitude: lon,
        })
        .min_by(|a, b| {
            a.distance_to(latitude, longitude)
                .total_cmp(&b.distance_to(latitude, longitude))
        })
        .unwrap_or_else(Region::unknown)
}

/// Locates node hosts.
#[async_trait]
pub trait RegionLocator: Send + Sync {
    async fn locate(&self, host: &str) -> Result<Region>;
}

/// Locates hosts through the free ip-api.com geolocation service.
pub struct IpApiLocator {
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct Location {
    lat: f64,
    lon: f64,
}

impl IpApiLocator {
    const ENDPOINT: &'static str = "http://ip-api.com/json";
    const TIMEOUT: Duration = Duration::from_secs(10);

    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built.
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder().timeout(Self::TIMEOUT).build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl RegionLocator for IpApiLocator {
    async fn locate(&self, host: &str) -> Result<Region> {
        let url = format!("{}/{host}?fields=lat,lon", Self::ENDPOINT);
        let response = self.http.get(url).send().await?.error_for_status()?;
        let location: Location = protocol::json(&response.text().await?, "location")?;

        Ok(closest_region(location.lat, location.lon))
    }
}
