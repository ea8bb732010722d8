use std::path::{Path, PathBuf};

use retl_adapters::{cursor_after_page, parse_listing_page, RecordNormalizer};
use retl_core::CanonicalRecord;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Snapshot {
    cursor: String,
    rejected: Vec<RejectedSnapshot>,
    records: Vec<CanonicalRecord>,
}

#[derive(Debug, Deserialize)]
struct RejectedSnapshot {
    index: usize,
    id: Option<String>,
    field: String,
}

fn sample_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/reddit/sample")
}

#[test]
fn sample_listing_matches_golden_snapshot() {
    let page = std::fs::read(sample_dir().join("page.json")).expect("read page fixture");
    let snapshot: Snapshot = serde_json::from_str(
        &std::fs::read_to_string(sample_dir().join("snapshot.json")).expect("read snapshot"),
    )
    .expect("parse snapshot");

    let items = parse_listing_page(&page).expect("parse listing");
    let normalized = RecordNormalizer.normalize(&items);

    assert_eq!(normalized.records, snapshot.records);
    assert_eq!(normalized.rejected.len(), snapshot.rejected.len());
    for (got, want) in normalized.rejected.iter().zip(&snapshot.rejected) {
        assert_eq!(got.index, want.index);
        assert_eq!(got.id, want.id);
        assert_eq!(got.field, want.field);
    }

    let cursor = cursor_after_page(&items).expect("cursor");
    assert_eq!(cursor.as_param(), Some(snapshot.cursor.as_str()));
}
