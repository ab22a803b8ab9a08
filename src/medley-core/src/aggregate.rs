//! Merging, deduplication and ranking of results from many sources.
//!
//! Each source's page is scored by position, weighted per source. Items that
//! more than one source returned (same normalised URL) are merged into one
//! hit and boosted. Ranking is deterministic regardless of the order sources
//! answered in.

use crate::models::Media;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use url::Url;

const DEFAULT_WEIGHT: f64 = 1.0;
const POSITION_DECAY: f64 = 0.1;
const CROSS_SOURCE_BOOST: f64 = 0.2;

/// One deduplicated, scored result.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub media: Media,
    /// Every source that returned this item, sorted by id.
    pub sources: Vec<String>,
    pub score: f64,
}

/// One source's copy of an item.
#[derive(Debug, Clone)]
struct Record {
    score: f64,
    origin: (String, usize),
    media: Media,
}

impl Record {
    /// Higher score first, then lower `(source_id, position)`.
    fn rank(&self, other: &Self) -> Ordering {
        other
            .score
            .partial_cmp(&self.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.origin.cmp(&other.origin))
    }
}

/// Records are kept in rank order; the first one is the winner.
#[derive(Debug, Clone)]
struct Entry {
    sources: Vec<String>,
    records: Vec<Record>,
}

impl Entry {
    fn best(&self) -> &Record {
        &self.records[0]
    }

    fn final_score(&self) -> f64 {
        cross_source_boost(self.best().score, self.sources.len())
    }

    fn add(&mut self, record: Record) {
        let source_id = &record.origin.0;
        if let Err(at) = self.sources.binary_search(source_id) {
            self.sources.insert(at, source_id.clone());
        }
        let at = self
            .records
            .partition_point(|r| r.rank(&record) != Ordering::Greater);
        self.records.insert(at, record);
    }

    fn into_hit(self) -> SearchHit {
        let score = self.final_score();
        let mut records = self.records;
        let mut media = records.remove(0).media;
        for other in &records {
            media.merge_missing(&other.media);
        }
        SearchHit {
            media,
            sources: self.sources,
            score,
        }
    }
}

/// Incrementally merges pages as sources answer.
#[derive(Debug, Clone, Default)]
pub struct Aggregator {
    weights: BTreeMap<String, f64>,
    entries: Vec<Entry>,
    by_key: HashMap<String, usize>,
}

impl Aggregator {
    pub fn new(weights: BTreeMap<String, f64>) -> Self {
        Self {
            weights,
            ..Self::default()
        }
    }

    /// Merge one source's results. Returns how many previously unseen items it contributed.
    ///
    /// When two sources score an item equally, the copy from the lower
    /// `(source_id, position)` wins, so the merged hit never depends on
    /// which source answered first.
    pub fn push(&mut self, source_id: &str, items: Vec<Media>) -> usize {
        let weight = self
            .weights
            .get(source_id)
            .copied()
            .unwrap_or(DEFAULT_WEIGHT);
        let mut fresh = 0;

        for (position, media) in items.into_iter().enumerate() {
            let key = dedup_key(&media);
            let record = Record {
                score: position_score(weight, position),
                origin: (source_id.to_string(), position),
                media,
            };
            match self.by_key.get(&key) {
                Some(&index) => self.entries[index].add(record),
                None => {
                    self.by_key.insert(key, self.entries.len());
                    self.entries.push(Entry {
                        sources: vec![source_id.to_string()],
                        records: vec![record],
                    });
                    fresh += 1;
                }
            }
        }
        fresh
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current ranking without consuming the aggregator.
    pub fn snapshot(&self, max: usize) -> Vec<SearchHit> {
        rank(self.entries.clone(), max)
    }

    pub fn into_ranked(self, max: usize) -> Vec<SearchHit> {
        rank(self.entries, max)
    }
}

fn rank(mut entries: Vec<Entry>, max: usize) -> Vec<SearchHit> {
    entries.sort_by(|a, b| {
        b.final_score()
            .partial_cmp(&a.final_score())
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.best().origin.cmp(&b.best().origin))
    });
    entries.truncate(max);
    entries.into_iter().map(Entry::into_hit).collect()
}

/// `weight * 1 / (1 + 0.1 * position)`: the first result keeps the full weight.
pub fn position_score(weight: f64, position: usize) -> f64 {
    weight / (1.0 + position as f64 * POSITION_DECAY)
}

/// Boost an item by 20% for every additional source that returned it.
pub fn cross_source_boost(score: f64, source_count: usize) -> f64 {
    let extra = source_count.saturating_sub(1) as f64;
    score * (1.0 + CROSS_SOURCE_BOOST * extra)
}

/// Identity used for deduplication: the normalised URL when the item has one,
/// otherwise its source-scoped id.
pub fn dedup_key(media: &Media) -> String {
    match media.url.as_deref() {
        Some(url) if !url.trim().is_empty() => normalize_url(url),
        _ => format!("{}:{}", media.source_id, media.id),
    }
}

/// Canonicalise a URL so equivalent locations compare equal.
///
/// Scheme and host are lowercased by the parser; the fragment, default ports
/// and a trailing slash are dropped; query parameters are sorted. Input that
/// does not parse is returned unchanged.
pub fn normalize_url(raw: &str) -> String {
    let Ok(mut parsed) = Url::parse(raw.trim()) else {
        return raw.to_string();
    };

    parsed.set_fragment(None);
    if parsed.port().is_some() && parsed.port() == parsed.port_or_known_default() {
        let _ = parsed.set_port(None);
    }

    let mut params: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if params.is_empty() {
        parsed.set_query(None);
    } else {
        params.sort();
        parsed.query_pairs_mut().clear().extend_pairs(params);
    }

    let path = parsed.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        parsed.set_path(path.trim_end_matches('/'));
    }

    parsed.to_string()
}
