//! Downloading datasets from a CKAN open-data portal.
//!
//! We only need one API call. See
//! <https://docs.ckan.org/en/latest/api/index.html#ckan.logic.action.get.package_show>.

use std::path::Path;

use anyhow::{format_err, Context};
use serde::Deserialize;
use tokio::fs;
use tracing::{debug, info, instrument};
use url::Url;

use crate::{
    http::{HttpFetcher, HyperFetcher},
    Result,
};

/// The City of Toronto's open-data portal.
pub const DEFAULT_BASE_URL: &str = "https://ckan0.cf.opendata.inter.prod-toronto.ca";

/// The body of a `package_show` response.
#[derive(Debug, Deserialize)]
struct PackageShowResponse {
    success: bool,
    #[serde(default)]
    result: Option<Package>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

/// A CKAN package (what the portal calls a dataset).
#[derive(Clone, Debug, Deserialize)]
pub struct Package {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

/// A downloadable file belonging to a package.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Resource {
    pub url: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub name: String,
}

/// Build the `package_show` URL for `package_id`.
pub fn package_show_url(base_url: &Url, package_id: &str) -> Result<Url> {
    let mut url = base_url
        .join("api/3/action/package_show")
        .with_context(|| format_err!("cannot build package_show URL from {}", base_url))?;
    url.query_pairs_mut().append_pair("id", package_id);
    Ok(url)
}

/// Parse a `package_show` response body.
pub fn parse_package_show(body: &[u8]) -> Result<Package> {
    let response: PackageShowResponse =
        serde_json::from_slice(body).context("cannot parse package_show response")?;
    match response {
        PackageShowResponse {
            success: true,
            result: Some(package),
            ..
        } => Ok(package),
        PackageShowResponse { error, .. } => Err(format_err!(
            "package_show failed: {}",
            error.map(|e| e.to_string()).unwrap_or_else(|| "no result".to_owned())
        )),
    }
}

/// Choose the resource to download. We try each format in
/// `format_priority` in turn, and return the first resource with that
/// format. Formats are compared case-insensitively.
pub fn select_resource<'a, S: AsRef<str>>(
    resources: &'a [Resource],
    format_priority: &[S],
) -> Option<&'a Resource> {
    format_priority.iter().find_map(|format| {
        resources
            .iter()
            .find(|r| r.format.trim().eq_ignore_ascii_case(format.as_ref().trim()))
    })
}

/// Look up `package_id` and choose which of its resources to download.
#[instrument(level = "debug", skip(fetcher, format_priority))]
pub async fn find_resource(
    fetcher: &dyn HttpFetcher,
    base_url: &Url,
    package_id: &str,
    format_priority: &[String],
) -> Result<Resource> {
    let url = package_show_url(base_url, package_id)?;
    let response = fetcher.get(&url).await?;
    if !response.is_success() {
        return Err(format_err!(
            "package_show for {:?} returned HTTP {}",
            package_id,
            response.status
        ));
    }
    let package = parse_package_show(&response.body)?;
    debug!(
        "package {:?} has {} resources",
        package.name,
        package.resources.len()
    );
    select_resource(&package.resources, format_priority)
        .cloned()
        .ok_or_else(|| {
            format_err!(
                "package {:?} has no resource in any of the formats {:?}",
                package_id,
                format_priority
            )
        })
}

/// Download the preferred resource of `package_id` to `out_path`.
///
/// The download is written next to `out_path` and moved into place when it
/// is complete.
pub async fn download_package(
    fetcher: &HyperFetcher,
    base_url: &Url,
    package_id: &str,
    format_priority: &[String],
    out_path: &Path,
) -> Result<u64> {
    let resource = find_resource(fetcher, base_url, package_id, format_priority).await?;
    let url = Url::parse(&resource.url)
        .with_context(|| format_err!("resource has invalid URL {:?}", resource.url))?;
    info!("downloading {:?} ({}) from {}", resource.name, resource.format, url);

    if let Some(parent) = out_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format_err!("cannot create {}", parent.display()))?;
    }
    let tmp_path = out_path.with_extension("download");
    let mut out = fs::File::create(&tmp_path)
        .await
        .with_context(|| format_err!("cannot create {}", tmp_path.display()))?;
    let written = fetcher.download(&url, &mut out).await?;
    out.sync_all().await?;
    drop(out);
    fs::rename(&tmp_path, out_path)
        .await
        .with_context(|| format_err!("cannot move download to {}", out_path.display()))?;
    info!("wrote {} bytes to {}", written, out_path.display());
    Ok(written)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::geocoders::client::tests::ScriptedFetcher;

    fn resource(format: &str, name: &str) -> Resource {
        Resource {
            url: format!("https://example.com/{}", name),
            format: format.to_owned(),
            name: name.to_owned(),
        }
    }

    #[test]
    fn builds_package_show_url() {
        let base = Url::parse(DEFAULT_BASE_URL).unwrap();
        let url = package_show_url(&base, "parking-tickets").unwrap();
        assert_eq!(
            url.as_str(),
            "https://ckan0.cf.opendata.inter.prod-toronto.ca/api/3/action/package_show?id=parking-tickets"
        );
    }

    #[test]
    fn selects_by_priority_not_position() {
        let resources = vec![
            resource("ZIP", "tickets-2022.zip"),
            resource("csv", "tickets-2023.csv"),
            resource("CSV", "tickets-2024.csv"),
        ];
        let chosen = select_resource(&resources, &["CSV", "ZIP"]).unwrap();
        assert_eq!(chosen.name, "tickets-2023.csv");
        let chosen = select_resource(&resources, &["json", "zip"]).unwrap();
        assert_eq!(chosen.name, "tickets-2022.zip");
        assert!(select_resource(&resources, &["XLSX"]).is_none());
    }

    #[test]
    fn reports_ckan_errors() {
        let err = parse_package_show(
            br#"{"success": false, "error": {"message": "Not found", "__type": "Not Found Error"}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Not found"));
    }

    #[tokio::test]
    async fn finds_resource_via_package_show() {
        const BODY: &str = r#"{
            "success": true,
            "result": {
                "name": "parking-tickets",
                "resources": [
                    {"url": "https://example.com/readme.xlsx", "format": "XLSX", "name": "readme"},
                    {"url": "https://example.com/tickets.zip", "format": "ZIP", "name": "tickets"}
                ]
            }
        }"#;
        let fetcher = Arc::new(ScriptedFetcher::new(vec![Some((200, BODY))]));
        let base = Url::parse("https://ckan.example.com/").unwrap();
        let resource = find_resource(
            fetcher.as_ref(),
            &base,
            "parking-tickets",
            &["CSV".to_owned(), "ZIP".to_owned()],
        )
        .await
        .unwrap();
        assert_eq!(resource.url, "https://example.com/tickets.zip");

        let fetcher = Arc::new(ScriptedFetcher::new(vec![Some((404, "{}"))]));
        assert!(find_resource(fetcher.as_ref(), &base, "nope", &["CSV".to_owned()])
            .await
            .is_err());
    }
}
