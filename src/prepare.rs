//! Turning raw ticket records into a list of queries to geocode.

use std::{collections::HashSet, io, path::Path};

use anyhow::{format_err, Context};
use csv::StringRecord;
use tracing::{info, instrument, trace};

use crate::{
    addresses::{normalize, LocationColumns, Locality},
    files::write_json_atomically,
    Result,
};

/// What happened while preparing a query list.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PrepareStats {
    /// Records read from the CSV file.
    pub records: usize,
    /// Records with no usable street.
    pub skipped: usize,
    /// Distinct queries we produced.
    pub unique: usize,
}

/// Read ticket records from `rdr`, and return the distinct normalized
/// queries in the order we first saw them.
pub fn queries_from_csv<R: io::Read>(
    rdr: R,
    columns: &LocationColumns<String>,
    locality: &Locality,
) -> Result<(Vec<String>, PrepareStats)> {
    let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(rdr);
    let headers = rdr.headers().context("cannot read CSV header")?.clone();
    let columns = columns.convert_to_indices_using_headers(&headers)?;

    let mut stats = PrepareStats::default();
    let mut seen = HashSet::new();
    let mut queries = vec![];
    let mut record = StringRecord::new();
    while rdr
        .read_record(&mut record)
        .with_context(|| format_err!("cannot read CSV record {}", stats.records + 1))?
    {
        stats.records += 1;
        let location = columns.extract_from_record(&record);
        match normalize(&location, locality) {
            Some(query) => {
                if seen.insert(query.clone()) {
                    queries.push(query);
                }
            }
            None => {
                trace!("skipping record with no street: {:?}", location);
                stats.skipped += 1;
            }
        }
    }
    stats.unique = queries.len();
    Ok((queries, stats))
}

/// Read a ticket CSV file at `input` and write its query list to `output`.
#[instrument(level = "debug", skip(columns, locality))]
pub fn prepare_queries(
    input: &Path,
    output: &Path,
    columns: &LocationColumns<String>,
    locality: &Locality,
) -> Result<PrepareStats> {
    let f = std::fs::File::open(input)
        .with_context(|| format_err!("cannot open {}", input.display()))?;
    let (queries, stats) = queries_from_csv(io::BufReader::new(f), columns, locality)
        .with_context(|| format_err!("error reading {}", input.display()))?;
    write_json_atomically(output, &queries, true)?;
    info!(
        "read {} records: {} skipped, {} unique queries written to {}",
        stats.records,
        stats.skipped,
        stats.unique,
        output.display(),
    );
    Ok(stats)
}
