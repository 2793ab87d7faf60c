use crate::common::types::SeriesId;
use crate::error::{TsdbError, TsdbResult};
use crate::index::filters::{CompiledMatcher, TagPredicate};
use crate::meta::SeriesDef;
use ahash::AHashMap;
use roaring::RoaringBitmap;
use smallvec::SmallVec;
use std::sync::RwLock;

/// Separator for the identity key; rejected in metric and tag strings at
/// ingress, so composed keys cannot collide.
const IDENTITY_SEP: char = '\u{1f}';

type TagIds = SmallVec<[(u32, u32); 8]>;

struct SeriesEntry {
    metric: u32,
    /// `(key id, value id)` pairs in canonical (lexicographic key) order.
    tags: TagIds,
}

#[derive(Default)]
struct IndexInner {
    /// Interner over metric names, tag keys and tag values (shared id
    /// space; ids are dense and monotone).
    names: Vec<String>,
    ids: AHashMap<String, u32>,

    /// Indexed by series id; ids are dense per run.
    series: Vec<SeriesEntry>,
    identity: AHashMap<String, SeriesId>,

    metric_index: AHashMap<u32, RoaringBitmap>,
    key_index: AHashMap<u32, RoaringBitmap>,
    kv_index: AHashMap<(u32, u32), RoaringBitmap>,

    next_series_id: SeriesId,
}

impl IndexInner {
    fn intern(&mut self, name: &str) -> u32 {
        if let Some(id) = self.ids.get(name) {
            return *id;
        }
        let id = self.names.len() as u32;
        self.names.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        id
    }

    fn identity_key(metric: &str, tags: &[(String, String)]) -> String {
        let mut key = String::with_capacity(metric.len() + tags.len() * 16);
        key.push_str(metric);
        for (k, v) in tags {
            key.push(IDENTITY_SEP);
            key.push_str(k);
            key.push(IDENTITY_SEP);
            key.push_str(v);
        }
        key
    }

    fn insert_series(&mut self, id: SeriesId, metric: &str, tags: &[(String, String)]) {
        let metric_id = self.intern(metric);
        let mut tag_ids: TagIds = SmallVec::with_capacity(tags.len());
        for (key, value) in tags {
            let key_id = self.intern(key);
            let value_id = self.intern(value);
            tag_ids.push((key_id, value_id));
            self.key_index.entry(key_id).or_default().insert(id);
            self.kv_index
                .entry((key_id, value_id))
                .or_default()
                .insert(id);
        }
        self.metric_index.entry(metric_id).or_default().insert(id);
        self.identity
            .insert(Self::identity_key(metric, tags), id);

        debug_assert_eq!(self.series.len(), id as usize);
        self.series.push(SeriesEntry {
            metric: metric_id,
            tags: tag_ids,
        });
    }
}

/// Interns tag keys/values to dense ids and resolves query predicates to
/// series id sets via per-label bitmaps.
#[derive(Default)]
pub struct TagIndex {
    inner: RwLock<IndexInner>,
}

impl TagIndex {
    pub fn new() -> TagIndex {
        TagIndex::default()
    }

    /// Rebuild from meta log replay. Definitions arrive in id order.
    pub fn load(&self, defs: &[SeriesDef]) -> TsdbResult<()> {
        let mut inner = self.inner.write().unwrap();
        for def in defs {
            if def.id as usize != inner.series.len() {
                return Err(TsdbError::Fatal(format!(
                    "series id {} out of order in meta log",
                    def.id
                )));
            }
            inner.insert_series(def.id, &def.metric, &def.tags);
        }
        inner.next_series_id = inner.series.len() as SeriesId;
        Ok(())
    }

    pub fn intern(&self, name: &str) -> u32 {
        self.inner.write().unwrap().intern(name)
    }

    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.inner.read().unwrap().ids.get(name).copied()
    }

    pub fn name_of(&self, id: u32) -> Option<String> {
        self.inner.read().unwrap().names.get(id as usize).cloned()
    }

    pub fn series_count(&self) -> usize {
        self.inner.read().unwrap().series.len()
    }

    /// Resolve `(metric, canonical tags)` to its series id, assigning the
    /// next id on first sight. Returns `(id, created)`.
    pub fn get_or_create(&self, metric: &str, tags: &[(String, String)]) -> (SeriesId, bool) {
        {
            let inner = self.inner.read().unwrap();
            let key = IndexInner::identity_key(metric, tags);
            if let Some(id) = inner.identity.get(&key) {
                return (*id, false);
            }
        }
        let mut inner = self.inner.write().unwrap();
        // racing writers may have created it first
        let key = IndexInner::identity_key(metric, tags);
        if let Some(id) = inner.identity.get(&key) {
            return (*id, false);
        }
        let id = inner.next_series_id;
        inner.next_series_id += 1;
        inner.insert_series(id, metric, tags);
        (id, true)
    }

    /// Look up a series id without creating it.
    pub fn resolve_identity(&self, metric: &str, tags: &[(String, String)]) -> Option<SeriesId> {
        let inner = self.inner.read().unwrap();
        inner
            .identity
            .get(&IndexInner::identity_key(metric, tags))
            .copied()
    }

    /// The canonical tag set of a series, as strings.
    pub fn series_tags(&self, id: SeriesId) -> Vec<(String, String)> {
        let inner = self.inner.read().unwrap();
        let Some(entry) = inner.series.get(id as usize) else {
            return Vec::new();
        };
        entry
            .tags
            .iter()
            .map(|(k, v)| {
                (
                    inner.names[*k as usize].clone(),
                    inner.names[*v as usize].clone(),
                )
            })
            .collect()
    }

    pub fn series_metric(&self, id: SeriesId) -> Option<String> {
        let inner = self.inner.read().unwrap();
        let entry = inner.series.get(id as usize)?;
        Some(inner.names[entry.metric as usize].clone())
    }

    /// All series of `metric` matching every predicate. With
    /// `explicit_tags`, only series whose key set equals the queried key
    /// set exactly.
    pub fn resolve(
        &self,
        metric: &str,
        predicates: &[TagPredicate],
        explicit_tags: bool,
    ) -> TsdbResult<RoaringBitmap> {
        let inner = self.inner.read().unwrap();

        let Some(metric_id) = inner.ids.get(metric) else {
            return Ok(RoaringBitmap::new());
        };
        let Some(candidates) = inner.metric_index.get(metric_id) else {
            return Ok(RoaringBitmap::new());
        };
        let mut result = candidates.clone();

        for predicate in predicates {
            if result.is_empty() {
                break;
            }
            // every filter form requires the key to be present
            let Some(key_id) = inner.ids.get(&predicate.key).copied() else {
                return Ok(RoaringBitmap::new());
            };
            match inner.key_index.get(&key_id) {
                Some(with_key) => result &= with_key,
                None => return Ok(RoaringBitmap::new()),
            }

            match predicate.filter.compile()? {
                CompiledMatcher::Any => {}
                CompiledMatcher::Exact(value) => {
                    // pre-resolved value id; an unseen value matches nothing
                    match inner
                        .ids
                        .get(&value)
                        .and_then(|vid| inner.kv_index.get(&(key_id, *vid)))
                    {
                        Some(bitmap) => result &= bitmap,
                        None => return Ok(RoaringBitmap::new()),
                    }
                }
                CompiledMatcher::AnyOf(values) => {
                    let mut union = RoaringBitmap::new();
                    for value in &values {
                        if let Some(bitmap) = inner
                            .ids
                            .get(value)
                            .and_then(|vid| inner.kv_index.get(&(key_id, *vid)))
                        {
                            union |= bitmap;
                        }
                    }
                    result &= union;
                }
                matcher => {
                    // pattern and negated forms scan the surviving
                    // candidates
                    let mut keep = RoaringBitmap::new();
                    for id in result.iter() {
                        let entry = &inner.series[id as usize];
                        let value = entry
                            .tags
                            .iter()
                            .find(|(k, _)| *k == key_id)
                            .map(|(_, v)| inner.names[*v as usize].as_str());
                        if let Some(value) = value {
                            if matcher.matches(value) {
                                keep.insert(id);
                            }
                        }
                    }
                    result = keep;
                }
            }
        }

        if explicit_tags {
            let mut queried_keys: Vec<&str> =
                predicates.iter().map(|p| p.key.as_str()).collect();
            queried_keys.sort_unstable();
            queried_keys.dedup();

            let mut keep = RoaringBitmap::new();
            for id in result.iter() {
                let entry = &inner.series[id as usize];
                if entry.tags.len() != queried_keys.len() {
                    continue;
                }
                let all_queried = entry
                    .tags
                    .iter()
                    .all(|(k, _)| queried_keys.contains(&inner.names[*k as usize].as_str()));
                if all_queried {
                    keep.insert(id);
                }
            }
            result = keep;
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::filters::{TagFilter, TagPredicate};

    fn tags(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn seeded_index() -> TagIndex {
        let index = TagIndex::new();
        index.get_or_create("cpu.user", &tags(&[("dc", "east"), ("host", "web01")]));
        index.get_or_create("cpu.user", &tags(&[("dc", "east"), ("host", "web02")]));
        index.get_or_create("cpu.user", &tags(&[("dc", "west"), ("host", "db01")]));
        index.get_or_create("mem.free", &tags(&[("host", "web01")]));
        index
    }

    fn resolve_vec(index: &TagIndex, metric: &str, preds: &[TagPredicate], explicit: bool) -> Vec<u32> {
        index
            .resolve(metric, preds, explicit)
            .unwrap()
            .iter()
            .collect()
    }

    #[test]
    fn ids_are_monotone_and_stable() {
        let index = seeded_index();
        let (id, created) =
            index.get_or_create("cpu.user", &tags(&[("dc", "east"), ("host", "web01")]));
        assert_eq!(id, 0);
        assert!(!created);
        let (id, created) = index.get_or_create("cpu.user", &tags(&[("host", "new")]));
        assert_eq!(id, 4);
        assert!(created);
    }

    #[test]
    fn same_tags_different_metric_is_a_different_series() {
        let index = seeded_index();
        let (id, created) = index.get_or_create("mem.used", &tags(&[("host", "web01")]));
        assert!(created);
        assert_eq!(id, 4);
    }

    #[test]
    fn resolves_by_metric_only() {
        let index = seeded_index();
        assert_eq!(resolve_vec(&index, "cpu.user", &[], false), vec![0, 1, 2]);
        assert_eq!(resolve_vec(&index, "nope", &[], false), Vec::<u32>::new());
    }

    #[test]
    fn exact_and_any_of_use_value_ids() {
        let index = seeded_index();
        let exact = [TagPredicate::grouping(
            "host",
            TagFilter::Exact("web01".to_string()),
        )];
        assert_eq!(resolve_vec(&index, "cpu.user", &exact, false), vec![0]);

        let any_of = [TagPredicate::grouping(
            "host",
            TagFilter::AnyOf(vec!["web01".to_string(), "db01".to_string()]),
        )];
        assert_eq!(resolve_vec(&index, "cpu.user", &any_of, false), vec![0, 2]);

        let missing = [TagPredicate::grouping(
            "host",
            TagFilter::Exact("never-seen".to_string()),
        )];
        assert_eq!(
            resolve_vec(&index, "cpu.user", &missing, false),
            Vec::<u32>::new()
        );
    }

    #[test]
    fn wildcard_scans_candidates() {
        let index = seeded_index();
        let preds = [TagPredicate::grouping(
            "host",
            TagFilter::Wildcard("web*".to_string()),
        )];
        assert_eq!(resolve_vec(&index, "cpu.user", &preds, false), vec![0, 1]);
    }

    #[test]
    fn predicates_intersect() {
        let index = seeded_index();
        let preds = [
            TagPredicate::grouping("dc", TagFilter::Exact("east".to_string())),
            TagPredicate::grouping("host", TagFilter::Wildcard("*02".to_string())),
        ];
        assert_eq!(resolve_vec(&index, "cpu.user", &preds, false), vec![1]);
    }

    #[test]
    fn explicit_tags_requires_exact_key_set() {
        let index = seeded_index();
        let preds = [TagPredicate::grouping("host", TagFilter::Any)];
        // cpu.user series all carry dc too, so none match exactly
        assert_eq!(
            resolve_vec(&index, "cpu.user", &preds, true),
            Vec::<u32>::new()
        );
        assert_eq!(resolve_vec(&index, "mem.free", &preds, true), vec![3]);
    }

    #[test]
    fn load_from_replay_resumes_ids() {
        use crate::meta::SeriesDef;
        let index = TagIndex::new();
        index
            .load(&[
                SeriesDef {
                    id: 0,
                    metric: "m".to_string(),
                    tags: tags(&[("host", "a")]),
                },
                SeriesDef {
                    id: 1,
                    metric: "m".to_string(),
                    tags: tags(&[("host", "b")]),
                },
            ])
            .unwrap();
        let (id, created) = index.get_or_create("m", &tags(&[("host", "a")]));
        assert_eq!((id, created), (0, false));
        let (id, created) = index.get_or_create("m", &tags(&[("host", "c")]));
        assert_eq!((id, created), (2, true));
    }
}
