//! Geocodio. See <https://www.geocod.io/docs/#geocoding>.

use anyhow::Context;
use serde::Deserialize;
use url::Url;

use crate::Result;

use super::{Backend, Candidate};

const DEFAULT_BASE_URL: &str = "https://api.geocod.io/v1.7/geocode";

#[derive(Debug, Deserialize)]
struct GeocodioResponse {
    #[serde(default)]
    results: Vec<GeocodioResult>,
}

#[derive(Debug, Deserialize)]
struct GeocodioResult {
    #[serde(default)]
    formatted_address: Option<String>,
    location: GeocodioLocation,
}

#[derive(Debug, Deserialize)]
struct GeocodioLocation {
    lat: f64,
    lng: f64,
}

pub struct Geocodio {
    api_key: String,
    base_url: Url,
}

impl Geocodio {
    pub fn new(api_key: String, base_url: Option<Url>) -> Result<Geocodio> {
        let base_url = match base_url {
            Some(base_url) => base_url,
            None => Url::parse(DEFAULT_BASE_URL)?,
        };
        Ok(Geocodio { api_key, base_url })
    }
}

impl Backend for Geocodio {
    fn tag(&self) -> &str {
        "geocodio"
    }

    fn request_url(&self, query: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair("q", query)
            .append_pair("api_key", &self.api_key)
            .append_pair("limit", "1")
            .finish();
        Ok(url)
    }

    fn parse_response(&self, body: &[u8]) -> Result<Option<Candidate>> {
        let response: GeocodioResponse = serde_json::from_slice(body)
            .context("could not parse Geocodio response")?;
        Ok(response.results.into_iter().next().map(|result| Candidate {
            lat: result.location.lat,
            lon: result.location.lng,
            display_name: result.formatted_address,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> Geocodio {
        Geocodio::new("key".to_owned(), None).unwrap()
    }

    #[test]
    fn parses_first_result() {
        let body = br#"{
            "input": {"formatted_address": "4700 Keele St, Toronto, ON"},
            "results": [
                {
                    "formatted_address": "4700 Keele St, Toronto, ON M3J 1P3",
                    "location": {"lat": 43.7735, "lng": -79.5019},
                    "accuracy": 1
                }
            ]
        }"#;
        let candidate = backend().parse_response(body).unwrap().unwrap();
        assert_eq!(candidate.lat, 43.7735);
        assert_eq!(candidate.lon, -79.5019);
        assert_eq!(
            candidate.display_name.as_deref(),
            Some("4700 Keele St, Toronto, ON M3J 1P3")
        );
    }

    #[test]
    fn parses_no_results() {
        assert_eq!(backend().parse_response(br#"{"results": []}"#).unwrap(), None);
    }

    #[test]
    fn builds_request_url() {
        let url = backend().request_url("A and B, Toronto, ON, Canada").unwrap();
        assert!(url.as_str().starts_with("https://api.geocod.io/v1.7/geocode?q="));
        assert!(url.as_str().contains("api_key=key"));
    }
}
