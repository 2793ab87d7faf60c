//! Randomized end-to-end properties: permuted writes come back sorted and
//! duplicate-resolved, and reads across bucket boundaries stay seamless.

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::collections::BTreeMap;
use tickdb::{Settings, Tsdb};

#[test]
fn permuted_writes_read_back_sorted_and_deduped() {
    let dir = tempfile::tempdir().unwrap();
    let db = Tsdb::open(dir.path(), Settings::default()).unwrap();
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x7e57);

    // timestamps inside one bucket, shuffled, with deliberate duplicates
    let mut timestamps: Vec<i64> = (0..500).map(|i| 1_000_000 + i * 1_000).collect();
    timestamps.shuffle(&mut rng);
    for _ in 0..50 {
        let dup = timestamps[rng.gen_range(0..500)];
        timestamps.push(dup);
    }

    let mut expected: BTreeMap<i64, f64> = BTreeMap::new();
    for (i, ts) in timestamps.iter().enumerate() {
        let value = i as f64;
        db.put("prop.m", vec![("host".to_string(), "h1".to_string())], *ts, value)
            .unwrap();
        // last writer wins
        expected.insert(*ts, value);
    }

    let body = json!({
        "start": 0,
        "end": 7_000_000,
        "msResolution": true,
        "queries": [{"metric": "prop.m", "aggregator": "sum", "tags": {}}]
    })
    .to_string();
    let (result, _) = db.query_json(&body).unwrap();
    let dps = result[0]["dps"].as_object().unwrap();

    assert_eq!(dps.len(), expected.len());
    for (ts, value) in &expected {
        assert_eq!(
            dps[&ts.to_string()].as_f64().unwrap(),
            *value,
            "timestamp {ts}"
        );
    }
}

#[test]
fn queries_span_bucket_boundaries() {
    let dir = tempfile::tempdir().unwrap();
    let db = Tsdb::open(dir.path(), Settings::default()).unwrap();
    let bucket_width = 2 * 3600 * 1000; // default bucket duration in ms

    // one sample either side of the boundary, plus one exactly on it
    let points = [
        (bucket_width - 1_000, 1.0),
        (bucket_width, 2.0),
        (bucket_width + 1_000, 3.0),
    ];
    for (ts, value) in points {
        db.put("span.m", vec![("host".to_string(), "h1".to_string())], ts, value)
            .unwrap();
    }

    let body = json!({
        "start": 0,
        "end": bucket_width * 2,
        "msResolution": true,
        "queries": [{"metric": "span.m", "aggregator": "sum", "tags": {}}]
    })
    .to_string();
    let (result, _) = db.query_json(&body).unwrap();
    let dps = result[0]["dps"].as_object().unwrap();
    assert_eq!(dps.len(), 3);
    for (ts, value) in points {
        assert_eq!(dps[&ts.to_string()].as_f64().unwrap(), value);
    }
}

#[test]
fn series_ids_assign_in_first_seen_order() {
    use tickdb::index::TagIndex;

    let index = TagIndex::new();
    let mut ids = Vec::new();
    for host in ["a", "b", "c", "d"] {
        let (id, created) =
            index.get_or_create("order.m", &[("host".to_string(), host.to_string())]);
        assert!(created);
        ids.push(id);
    }
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    assert_eq!(ids, sorted, "ids grow monotonically");

    // revisiting any identity returns the original id
    let (id, created) = index.get_or_create("order.m", &[("host".to_string(), "b".to_string())]);
    assert!(!created);
    assert_eq!(id, ids[1]);
}

#[test]
fn large_series_roundtrip_across_many_pages() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::default();
    settings.page_size = 512; // force frequent page rollover
    let db = Tsdb::open(dir.path(), settings).unwrap();
    let mut rng = rand::rngs::StdRng::seed_from_u64(0xcafe);

    let mut ts = 1_000_000i64;
    let mut value = 100.0f64;
    let mut expected = Vec::new();
    for _ in 0..5_000 {
        ts += rng.gen_range(1..500);
        value += rng.gen_range(-1.0..1.0);
        db.put("big.m", vec![("host".to_string(), "h1".to_string())], ts, value)
            .unwrap();
        expected.push((ts, value));
    }

    let body = json!({
        "start": 0,
        "end": ts + 1,
        "msResolution": true,
        "queries": [{"metric": "big.m", "aggregator": "sum", "tags": {}}]
    })
    .to_string();
    let (result, _) = db.query_json(&body).unwrap();
    let dps = result[0]["dps"].as_object().unwrap();
    assert_eq!(dps.len(), expected.len());
    for (ts, value) in expected {
        let got = dps[&ts.to_string()].as_f64().unwrap();
        assert_eq!(got.to_bits(), value.to_bits(), "timestamp {ts}");
    }
}
