//! OpenStreetMap Nominatim.
//!
//! See <https://nominatim.org/release-docs/develop/api/Search/>. The public
//! instance allows at most one request per second.

use anyhow::Context;
use serde::Deserialize;
use url::Url;

use crate::Result;

use super::{parse_coordinate, Backend, Candidate};

const DEFAULT_BASE_URL: &str = "https://nominatim.openstreetmap.org/search";

/// A single place in a Nominatim-style search response. geocode.maps.co
/// returns the same format.
#[derive(Debug, Deserialize)]
pub(super) struct Place {
    lat: String,
    lon: String,
    #[serde(default)]
    display_name: Option<String>,
}

/// Parse a Nominatim-style array of places, and return the first.
pub(super) fn parse_places(body: &[u8]) -> Result<Option<Candidate>> {
    let places: Vec<Place> =
        serde_json::from_slice(body).context("could not parse search results")?;
    let Some(first) = places.into_iter().next() else {
        return Ok(None);
    };
    Ok(Some(Candidate {
        lat: parse_coordinate(&first.lat, "lat")?,
        lon: parse_coordinate(&first.lon, "lon")?,
        display_name: first.display_name,
    }))
}

/// The Nominatim backend.
pub struct Nominatim {
    base_url: Url,
}

impl Nominatim {
    pub fn new(base_url: Option<Url>) -> Result<Nominatim> {
        let base_url = match base_url {
            Some(base_url) => base_url,
            None => Url::parse(DEFAULT_BASE_URL)?,
        };
        Ok(Nominatim { base_url })
    }
}

impl Backend for Nominatim {
    fn tag(&self) -> &str {
        "nominatim"
    }

    fn request_url(&self, query: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair("q", query)
            .append_pair("format", "jsonv2")
            .append_pair("limit", "1")
            .finish();
        Ok(url)
    }

    fn parse_response(&self, body: &[u8]) -> Result<Option<Candidate>> {
        parse_places(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_request_url() {
        let backend = Nominatim::new(None).unwrap();
        let url = backend
            .request_url("4700 KEELE ST, Toronto, ON, Canada")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://nominatim.openstreetmap.org/search?q=4700+KEELE+ST%2C+Toronto%2C+ON%2C+Canada&format=jsonv2&limit=1",
        );
    }

    #[test]
    fn parses_first_place() {
        let body = br#"[
            {"lat": "43.7735", "lon": "-79.5019", "display_name": "York University"},
            {"lat": "1", "lon": "2"}
        ]"#;
        let candidate = Nominatim::new(None)
            .unwrap()
            .parse_response(body)
            .unwrap()
            .unwrap();
        assert!((candidate.lat - 43.7735).abs() < 1e-9);
        assert!((candidate.lon - -79.5019).abs() < 1e-9);
        assert_eq!(candidate.display_name.as_deref(), Some("York University"));
    }

    #[test]
    fn parses_empty_results() {
        assert_eq!(parse_places(b"[]").unwrap(), None);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_places(br#"{"error": "Unable to geocode"}"#).is_err());
        assert!(parse_places(br#"[{"lat": "x", "lon": "1"}]"#).is_err());
    }
}
