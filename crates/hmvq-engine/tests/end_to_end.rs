use std::path::{Path, PathBuf};

use hmvq_core::{MatchResult, MatchTier, Query, Record, Severity, Verdict};
use hmvq_engine::{assess_quote, build_dataset, build_dataset_from_table, Dataset};

fn fixture_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/hmv_sample.json")
}

fn sample_dataset() -> Dataset {
    let loaded = hmvq_adapters::load_table(fixture_path()).unwrap();
    build_dataset_from_table(&loaded.table)
        .unwrap()
        .with_source(loaded.source_name, loaded.sha256)
}

fn query(discrepancy: &str, corrective_action: &str, supplier_hours: f64) -> Query {
    Query {
        discrepancy: discrepancy.to_string(),
        corrective_action: corrective_action.to_string(),
        supplier_hours,
    }
}

#[test]
fn two_identical_records_average_to_five_hours() {
    let records = [4.0, 6.0]
        .into_iter()
        .map(|hours| Record {
            description: "Replace seal".into(),
            corrective_action: "Replaced seal and tested".into(),
            total_hours: hours,
            year: Some(2022),
            card_number: None,
            source_row: None,
        })
        .collect();
    let dataset = build_dataset(records).unwrap();
    let stats = dataset.rows()[0].stats.unwrap();
    assert_eq!(stats.fair_quote_hours, 5.0);
    assert_eq!(stats.occurrence_count, 2);

    let assessment = assess_quote(
        &dataset,
        &query("REPLACE SEAL", "REPLACED SEAL AND TESTED", 4.5),
    )
    .unwrap();
    assert_eq!(assessment.result.tier(), Some(MatchTier::Exact));
    // 4.5 is below the 5.00 fair quote.
    assert_eq!(assessment.conclusion.unwrap().verdict, Verdict::FairApprove);

    // |5.5 - 5| / 5 = 0.10 > 0.05
    let assessment = assess_quote(
        &dataset,
        &query("REPLACE SEAL", "REPLACED SEAL AND TESTED", 5.5),
    )
    .unwrap();
    assert_eq!(
        assessment.conclusion.unwrap().verdict,
        Verdict::BeyondRangeNeedsReview
    );

    let assessment = assess_quote(
        &dataset,
        &query("REPLACE SEAL", "REPLACED SEAL AND TESTED", 5.25),
    )
    .unwrap();
    assert_eq!(
        assessment.conclusion.unwrap().verdict,
        Verdict::InRangeConsiderApprove
    );
}

#[test]
fn sample_workbook_builds_expected_clusters() {
    let dataset = sample_dataset();
    let summary = dataset.summary();
    assert_eq!(summary.rows, 9);
    assert_eq!(summary.eligible_rows, 8);
    assert_eq!(summary.distinct_keys, 7);
    assert_eq!(summary.clusters, 5);
    assert_eq!(summary.source_name.as_deref(), Some("hmv_sample.json"));

    let seal = &dataset.clusters()[0];
    assert_eq!(seal.representative, "REPLACE SEAL | REPLACED SEAL AND TESTED");
    assert_eq!(seal.members.len(), 2);
    assert_eq!(seal.stats.occurrence_count, 3);
    assert_eq!(seal.stats.fair_quote_hours, 5.17);

    let faucet = dataset
        .rows()
        .iter()
        .find(|r| r.record.description.starts_with("Lavatory"))
        .unwrap();
    assert_eq!(faucet.fair_quote_hours(), Some(2.12));

    let card = dataset.rows()[5].record.card_number.as_deref();
    assert_eq!(card, Some("912"));
}

#[test]
fn reference_marker_and_dates_do_not_split_clusters() {
    let dataset = sample_dataset();
    assert_eq!(
        dataset.rows()[0].normalized.combined_key,
        dataset.rows()[1].normalized.combined_key
    );
}

#[test]
fn approximate_tier_for_a_reworded_tire_change() {
    let dataset = sample_dataset();
    let assessment = assess_quote(
        &dataset,
        &query(
            "Right main gear tire worn beyond limits",
            "Replaced tire assembly IAW AMM",
            3.5,
        ),
    )
    .unwrap();
    let MatchResult::Approximate { rows } = &assessment.result else {
        panic!("expected approximate tier, got {:?}", assessment.result);
    };
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].row.row_index, 5);
    assert_eq!(rows[1].row.row_index, 6);
    assert!(rows[0].overlap_score > rows[1].overlap_score);

    let conclusion = assessment.conclusion.unwrap();
    assert_eq!(conclusion.fair_quote_hours, 2.75);
    assert_eq!(conclusion.verdict, Verdict::BeyondRangeNeedsReview);
    assert_eq!(conclusion.severity, Severity::Review);
}

#[test]
fn nearest_reference_when_nothing_is_close() {
    let dataset = sample_dataset();
    let assessment = assess_quote(
        &dataset,
        &query("Engine cowl latch inop", "Adjusted cowl latch", 1.0),
    )
    .unwrap();
    let MatchResult::Nearest { row } = &assessment.result else {
        panic!("expected nearest tier, got {:?}", assessment.result);
    };
    assert_eq!(row.row.row_index, 8);
    assert!(row.overlap_score < 50.0);
    assert_eq!(assessment.conclusion.unwrap().verdict, Verdict::FairApprove);
}

#[test]
fn zero_hour_cluster_needs_manual_review() {
    let dataset = sample_dataset();
    let assessment = assess_quote(
        &dataset,
        &query("Cabin reading light inop", "Replaced reading light bulb", 0.5),
    )
    .unwrap();
    assert_eq!(assessment.result.tier(), Some(MatchTier::Exact));
    let conclusion = assessment.conclusion.unwrap();
    assert_eq!(conclusion.verdict, Verdict::NoHistoricalData);
    assert_eq!(conclusion.percent_difference, None);
}

#[test]
fn empty_history_reports_no_data() {
    let dataset = build_dataset(Vec::new()).unwrap();
    let assessment = assess_quote(&dataset, &query("Replace seal", "Replaced seal", 2.0)).unwrap();
    assert!(assessment.result.is_no_data());
    assert!(assessment.conclusion.is_none());
}
