//! Coarse blocking keys that shortlist merge candidates.
//!
//! An event is filed under one key per significant title token, plus one for its
//! venue and one for its street address when present, all scoped to
//! `(city, start day)`. Lookups also check the neighbouring days, so timezone or
//! rounding skew of a day does not hide a duplicate.

use std::collections::{BTreeSet, HashMap};

use chrono::{Days, NaiveDate};
use evcat_core::text::{normalize_text, tokens};

use crate::similarity::EventView;

const ADJACENT_DAYS: u64 = 1;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "at", "by", "for", "from", "in", "of", "on", "or", "the", "to", "with",
];

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey {
    pub city: String,
    pub day: NaiveDate,
    pub token: String,
}

/// Index from bucket keys to catalog slots.
#[derive(Debug, Default)]
pub struct Fingerprinter {
    buckets: HashMap<BucketKey, BTreeSet<usize>>,
}

impl Fingerprinter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tokens an event is filed under, independent of its day.
    pub fn tokens_for<E: EventView + ?Sized>(event: &E) -> BTreeSet<String> {
        let words = tokens(event.title());
        let significant = words
            .iter()
            .filter(|w| !STOPWORDS.contains(&w.as_str()))
            .cloned()
            .collect::<BTreeSet<_>>();
        let mut keys = if significant.is_empty() {
            words.into_iter().collect::<BTreeSet<_>>()
        } else {
            significant
        };

        let location = event.location();
        for (prefix, value) in [("venue", &location.venue), ("address", &location.address)] {
            if let Some(value) = value.as_deref().map(normalize_text).filter(|v| !v.is_empty()) {
                keys.insert(format!("{prefix}:{value}"));
            }
        }
        if keys.is_empty() {
            keys.insert("*".to_string());
        }
        keys
    }

    pub fn keys_for<E: EventView + ?Sized>(event: &E) -> Vec<BucketKey> {
        let city = event.location().city_key();
        let day = event.start().date_naive();
        Self::tokens_for(event)
            .into_iter()
            .map(|token| BucketKey {
                city: city.clone(),
                day,
                token,
            })
            .collect()
    }

    /// File `slot` under every key of `event`. Safe to call again after the event changes.
    pub fn insert<E: EventView + ?Sized>(&mut self, event: &E, slot: usize) {
        for key in Self::keys_for(event) {
            self.buckets.entry(key).or_default().insert(slot);
        }
    }

    /// Slots sharing any bucket with `event` on its day or an adjacent one.
    pub fn candidates<E: EventView + ?Sized>(&self, event: &E) -> BTreeSet<usize> {
        let city = event.location().city_key();
        let day = event.start().date_naive();
        let days = (1..=ADJACENT_DAYS)
            .flat_map(|n| [day.checked_sub_days(Days::new(n)), day.checked_add_days(Days::new(n))])
            .flatten()
            .chain(std::iter::once(day))
            .collect::<Vec<_>>();

        let mut out = BTreeSet::new();
        for token in Self::tokens_for(event) {
            for day in &days {
                let key = BucketKey {
                    city: city.clone(),
                    day: *day,
                    token: token.clone(),
                };
                if let Some(slots) = self.buckets.get(&key) {
                    out.extend(slots.iter().copied());
                }
            }
        }
        out
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use evcat_core::{EventLocation, RawEventRecord, SourceProvenance};

    fn record(title: &str, city: &str, start: DateTime<Utc>) -> RawEventRecord {
        RawEventRecord {
            title: title.into(),
            description: String::new(),
            start_time: start,
            end_time: None,
            location: EventLocation::new(city, "US"),
            price: None,
            category: None,
            tags: Vec::new(),
            provenance: SourceProvenance {
                platform: "test".into(),
                url: title.into(),
                scraped_at: start,
                source_id: None,
            },
        }
    }

    fn day(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, d, h, 0, 0).single().unwrap()
    }

    #[test]
    fn shared_token_on_adjacent_day_is_a_candidate() {
        let mut fp = Fingerprinter::new();
        fp.insert(&record("Tech Meetup NYC", "New York", day(20, 23)), 0);
        fp.insert(&record("Pottery Class", "New York", day(20, 18)), 1);
        fp.insert(&record("Tech Meetup NYC", "Boston", day(20, 18)), 2);
        fp.insert(&record("Tech Meetup NYC", "New York", day(25, 18)), 3);

        let incoming = record("NYC Tech Meetup", "new york", day(21, 1));
        assert_eq!(fp.candidates(&incoming), BTreeSet::from([0]));
    }

    #[test]
    fn venue_alone_links_differently_titled_events() {
        let mut fp = Fingerprinter::new();
        let mut a = record("Friday Jazz", "Chicago", day(20, 20));
        a.location.venue = Some("Green Mill".into());
        fp.insert(&a, 7);

        let mut b = record("Live Quartet", "Chicago", day(20, 21));
        b.location.venue = Some("The Green Mill".into());
        assert!(fp.candidates(&b).is_empty());
        b.location.venue = Some("green mill".into());
        assert_eq!(fp.candidates(&b), BTreeSet::from([7]));
    }

    #[test]
    fn stopword_only_and_empty_titles_still_get_keys() {
        let the = record("The", "Austin", day(20, 18));
        assert_eq!(Fingerprinter::tokens_for(&the), BTreeSet::from(["the".to_string()]));
        let empty = record("", "Austin", day(20, 18));
        assert_eq!(Fingerprinter::tokens_for(&empty), BTreeSet::from(["*".to_string()]));
    }
}
