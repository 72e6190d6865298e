//! The geocoding providers we know how to talk to.
//!
//! A [`Backend`] only knows how to build a request URL for a query and how to
//! read a successful response. Everything else (rate limits, retries, status
//! codes) is handled by [`super::client::ProviderClient`].

use anyhow::format_err;
use strum_macros::{Display, EnumString};
use url::Url;

use crate::Result;

mod geocodio;
mod maps_co;
mod nominatim;

pub use self::{geocodio::Geocodio, maps_co::MapsCo, nominatim::Nominatim};

/// The best match a provider returned for a query.
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    pub lat: f64,
    pub lon: f64,
    pub display_name: Option<String>,
}

/// Provider-specific request and response formats.
pub trait Backend: Send + Sync + 'static {
    /// A short name for this provider, used as our result `source`.
    fn tag(&self) -> &str;

    /// Build the URL used to geocode `query`.
    fn request_url(&self, query: &str) -> Result<Url>;

    /// Parse the body of a successful response. Returns `None` if the
    /// provider found nothing, and an error if the body makes no sense.
    fn parse_response(&self, body: &[u8]) -> Result<Option<Candidate>>;
}

/// The providers we support.
#[derive(Clone, Copy, Debug, Display, EnumString, Eq, PartialEq)]
#[strum(serialize_all = "kebab-case")]
pub enum ProviderKind {
    /// OpenStreetMap Nominatim. Free, but limited to one request per second.
    Nominatim,
    /// Geocodio. Requires an API key.
    Geocodio,
    /// geocode.maps.co. Requires an API key.
    MapsCo,
}

impl ProviderKind {
    /// Does this provider refuse to work without an API key?
    pub fn requires_api_key(self) -> bool {
        match self {
            ProviderKind::Nominatim => false,
            ProviderKind::Geocodio | ProviderKind::MapsCo => true,
        }
    }

    /// Build a backend for this provider.
    ///
    /// `base_url` overrides the provider's public endpoint, which is useful
    /// for self-hosted Nominatim instances.
    pub fn build(
        self,
        api_key: Option<&str>,
        base_url: Option<&Url>,
    ) -> Result<Box<dyn Backend>> {
        let api_key = api_key.map(str::trim).filter(|key| !key.is_empty());
        if self.requires_api_key() && api_key.is_none() {
            return Err(format_err!(
                "the {} provider requires an API key (set GEOCODER_API_KEY or pass --api-key)",
                self
            ));
        }
        Ok(match self {
            ProviderKind::Nominatim => Box::new(Nominatim::new(base_url.cloned())?),
            ProviderKind::Geocodio => Box::new(Geocodio::new(
                api_key.unwrap_or_default().to_owned(),
                base_url.cloned(),
            )?),
            ProviderKind::MapsCo => Box::new(MapsCo::new(
                api_key.unwrap_or_default().to_owned(),
                base_url.cloned(),
            )?),
        })
    }
}

/// Parse a coordinate that a provider sent to us as a string.
fn parse_coordinate(value: &str, name: &str) -> Result<f64> {
    let parsed = value
        .trim()
        .parse::<f64>()
        .map_err(|_| format_err!("invalid {} in response: {:?}", name, value))?;
    if parsed.is_finite() {
        Ok(parsed)
    } else {
        Err(format_err!("invalid {} in response: {:?}", name, value))
    }
}
