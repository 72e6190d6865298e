//! Types related to ticket locations, and the rules we use to turn them into
//! geocoder queries.

use std::collections::HashMap;

use anyhow::format_err;
use csv::StringRecord;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Tokens which describe where a ticket was issued relative to a street,
/// rather than the street itself. We strip these from the front of street
/// fields, as many times as they appear.
///
/// `N/S` means "north side", `N/O` means "north of", and so on. The versions
/// without a slash show up when the slash was lost somewhere upstream.
static PREFIX_TOKENS: &[&str] = &[
    "AT", "NR", "NEAR", "OPP", "OPPOSITE", "N/S", "S/S", "E/S", "W/S", "N/O",
    "S/O", "E/O", "W/O", "NS", "SS", "ES", "WS", "NO", "SO", "EO", "WO",
];

/// Characters which only separate tokens, and never carry meaning.
const SEPARATOR_PUNCTUATION: &[char] = &['-', ':'];

/// The raw location fields from a single ticket record.
///
/// Ticket data also has separate prefix and proximity columns (`location1`
/// and `location3` in the Toronto data), but they only ever hold the tokens
/// in `PREFIX_TOKENS`, so we never read them.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct RawLocation {
    /// The primary street reference, like `4700 KEELE ST`.
    #[serde(default)]
    pub street: String,
    /// The cross street, if any.
    #[serde(default)]
    pub cross_street: String,
}

/// The city, region and country that we append to every query.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Locality {
    pub city: String,
    pub region: String,
    pub country: String,
}

impl Default for Locality {
    fn default() -> Self {
        Locality {
            city: "Toronto".to_owned(),
            region: "ON".to_owned(),
            country: "Canada".to_owned(),
        }
    }
}

impl Locality {
    /// The suffix appended to each query, including the leading comma.
    fn suffix(&self) -> String {
        format!(", {}, {}, {}", self.city, self.region, self.country)
    }
}

/// Convert a ticket's raw location into a geocoder query.
///
/// Returns `None` if the record has no usable street, which is not an error.
/// This is a pure function, and it must stay stable, because its output is
/// used as our cache key.
pub fn normalize(location: &RawLocation, locality: &Locality) -> Option<String> {
    let street = clean_street(&location.street);
    let cross_street = clean_street(&location.cross_street);

    // Our fixed priority order: the street itself, then the cross street
    // standing in for it.
    let (primary, cross) = if !street.is_empty() {
        (street, Some(cross_street))
    } else if !cross_street.is_empty() {
        (cross_street, None)
    } else {
        return None;
    };

    let mut query = primary;
    match cross {
        // Some records repeat the street in the cross-street field.
        Some(cross) if !cross.is_empty() && cross != query => {
            query.push_str(" and ");
            query.push_str(&cross);
        }
        _ => {}
    }
    query.push_str(&locality.suffix());
    Some(query)
}

/// Clean up a single street field: drop separator punctuation, uppercase,
/// strip leading prefix tokens and collapse whitespace.
fn clean_street(raw: &str) -> String {
    let separated = raw.replace(SEPARATOR_PUNCTUATION, " ").to_uppercase();
    let mut tokens = separated.split_whitespace().peekable();
    while tokens
        .peek()
        .map_or(false, |token| PREFIX_TOKENS.contains(token))
    {
        tokens.next();
    }
    tokens.collect::<Vec<_>>().join(" ")
}

/// The columns of a ticket CSV file that hold location data.
///
/// `K` is typically either a `String` (for a column name) or a `usize` (for a
/// column index).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LocationColumns<K> {
    pub street: K,
    pub cross_street: Option<K>,
}

impl Default for LocationColumns<String> {
    /// The column names used by the City of Toronto parking ticket data.
    fn default() -> Self {
        LocationColumns {
            street: "location2".to_owned(),
            cross_street: Some("location4".to_owned()),
        }
    }
}

impl LocationColumns<String> {
    /// Given the header row of a CSV file, convert our column names into
    /// column indices.
    ///
    /// The street column must exist. The cross-street column is dropped if
    /// missing, because many ticket extracts leave it out.
    pub fn convert_to_indices_using_headers(
        &self,
        headers: &StringRecord,
    ) -> Result<LocationColumns<usize>> {
        let mut header_columns = HashMap::new();
        for (idx, header) in headers.iter().enumerate() {
            if let Some(_existing) = header_columns.insert(header.trim(), idx) {
                return Err(format_err!("duplicate header column `{}`", header));
            }
        }
        Ok(LocationColumns {
            street: header_columns.get(&self.street[..]).copied().ok_or_else(
                || format_err!("could not find column `{}` in header", self.street),
            )?,
            cross_street: self
                .cross_street
                .as_ref()
                .and_then(|name| header_columns.get(&name[..]).copied()),
        })
    }
}

impl LocationColumns<usize> {
    /// Extract a `RawLocation` from a CSV record.
    pub fn extract_from_record(&self, record: &StringRecord) -> RawLocation {
        let field = |idx: Option<usize>| {
            idx.and_then(|idx| record.get(idx))
                .unwrap_or("")
                .to_owned()
        };
        RawLocation {
            street: field(Some(self.street)),
            cross_street: field(self.cross_street),
        }
    }
}
