//! Running our subcommands from the command line.

use cli_test_dir::*;

/// A few Toronto parking tickets.
const TICKETS_CSV: &str = "\
tag_number_masked,date_of_infraction,infraction_code,location1,location2,location3,location4,province
***90163,20230101,5,NR,4700 KEELE ST,,,ON
***90164,20230101,5,AT,4700 KEELE ST,,,ON
***90165,20230102,29,OPP,,,,ON
***90166,20230102,29,,KING ST W,AT,SPADINA AVE,ON
";

#[test]
fn prepare_writes_unique_queries() {
    let testdir = TestDir::new("ticket-geocode", "prepare_writes_unique_queries");
    testdir.create_file("tickets.csv", TICKETS_CSV);

    testdir
        .cmd()
        .arg("prepare")
        .arg("tickets.csv")
        .arg("--output=queries.json")
        .output()
        .expect_success();

    let written = std::fs::read_to_string(testdir.path("queries.json")).unwrap();
    let queries: Vec<String> = serde_json::from_str(&written).unwrap();
    assert_eq!(
        queries,
        vec![
            "4700 KEELE ST, Toronto, ON, Canada",
            "KING ST W and SPADINA AVE, Toronto, ON, Canada",
        ]
    );
}

#[test]
fn prepare_uses_custom_locality() {
    let testdir = TestDir::new("ticket-geocode", "prepare_uses_custom_locality");
    testdir.create_file("tickets.csv", TICKETS_CSV);

    testdir
        .cmd()
        .arg("prepare")
        .arg("tickets.csv")
        .arg("--output=queries.json")
        .arg("--city=Etobicoke")
        .output()
        .expect_success();
    testdir.expect_contains("queries.json", "4700 KEELE ST, Etobicoke, ON, Canada");
}

#[test]
fn prepare_requires_street_column() {
    let testdir = TestDir::new("ticket-geocode", "prepare_requires_street_column");
    testdir.create_file("tickets.csv", TICKETS_CSV);

    let output = testdir
        .cmd()
        .arg("prepare")
        .arg("tickets.csv")
        .arg("--street-column=street")
        .output()
        .expect_failure();
    assert!(output.stderr_str().contains("street"));
}

#[test]
fn geocode_requires_api_key() {
    let testdir = TestDir::new("ticket-geocode", "geocode_requires_api_key");
    testdir.create_file("queries.json", r#"["4700 KEELE ST, Toronto, ON, Canada"]"#);

    let output = testdir
        .cmd()
        .env_remove("GEOCODER_API_KEY")
        .arg("geocode")
        .arg("--queries=queries.json")
        .arg("--provider=geocodio")
        .output()
        .expect_failure();
    assert!(output.stderr_str().contains("requires an API key"));
    testdir.expect_no_such_path("geocode_cache.json");
}

#[test]
fn geocode_rejects_unknown_provider() {
    let testdir = TestDir::new("ticket-geocode", "geocode_rejects_unknown_provider");

    testdir
        .cmd()
        .arg("geocode")
        .arg("--provider=google")
        .output()
        .expect_failure();
}

#[test]
fn geocode_requires_query_list() {
    let testdir = TestDir::new("ticket-geocode", "geocode_requires_query_list");

    let output = testdir
        .cmd()
        .arg("geocode")
        .arg("--queries=missing.json")
        .arg("--provider=nominatim")
        .output()
        .expect_failure();
    assert!(output.stderr_str().contains("missing.json"));
}
