//! geocode.maps.co, a hosted geocoder with a Nominatim-compatible API.

use url::Url;

use crate::Result;

use super::{nominatim::parse_places, Backend, Candidate};

const DEFAULT_BASE_URL: &str = "https://geocode.maps.co/search";

pub struct MapsCo {
    api_key: String,
    base_url: Url,
}

impl MapsCo {
    pub fn new(api_key: String, base_url: Option<Url>) -> Result<MapsCo> {
        let base_url = match base_url {
            Some(base_url) => base_url,
            None => Url::parse(DEFAULT_BASE_URL)?,
        };
        Ok(MapsCo { api_key, base_url })
    }
}

impl Backend for MapsCo {
    fn tag(&self) -> &str {
        "maps-co"
    }

    fn request_url(&self, query: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair("q", query)
            .append_pair("api_key", &self.api_key)
            .finish();
        Ok(url)
    }

    fn parse_response(&self, body: &[u8]) -> Result<Option<Candidate>> {
        parse_places(body)
    }
}
