mod common;

#[test]
fn test_generate_requests_csv() {
    let dir = tempfile::tempdir().unwrap();
    let output_path = dir.path().join("requests.csv");
    common::generate_requests_csv(&output_path, 200).expect("Failed to generate CSV");

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(&output_path)
        .expect("Failed to open CSV");

    let mut gateways = std::collections::HashSet::new();
    let mut rows = 0;
    for result in reader.records() {
        let record = result.expect("Failed to read record");
        let amount: rust_decimal::Decimal = record[2].parse().expect("Failed to parse amount");
        assert!(amount > rust_decimal::Decimal::ZERO);
        if &record[1] == "mobile_money" {
            assert!(record[4].starts_with("+2327"));
        }
        gateways.insert(record[1].to_string());
        rows += 1;
    }

    assert_eq!(rows, 200);
    assert_eq!(gateways.len(), 3, "Should have seen every rail");
}
