//! Weighted multi-factor similarity between two events.
//!
//! Every factor is symmetric in its arguments, so `score(a, b) == score(b, a)`.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use evcat_core::text::{normalize_city, normalize_text, token_set, tokens};
use evcat_core::{CanonicalEvent, EventLocation, RawEventRecord};
use serde::{Deserialize, Serialize};

use crate::config::{ScoreWeights, ScoringConfig};

const EARTH_RADIUS_KM: f64 = 6371.0;

/// The fields similarity looks at, shared by raw and canonical events.
pub trait EventView {
    fn title(&self) -> &str;
    fn description(&self) -> &str;
    fn start(&self) -> DateTime<Utc>;
    fn location(&self) -> &EventLocation;
}

impl EventView for RawEventRecord {
    fn title(&self) -> &str {
        &self.title
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn start(&self) -> DateTime<Utc> {
        self.start_time
    }

    fn location(&self) -> &EventLocation {
        &self.location
    }
}

impl EventView for CanonicalEvent {
    fn title(&self) -> &str {
        CanonicalEvent::title(self)
    }

    fn description(&self) -> &str {
        CanonicalEvent::description(self)
    }

    fn start(&self) -> DateTime<Utc> {
        CanonicalEvent::start(self)
    }

    fn location(&self) -> &EventLocation {
        CanonicalEvent::location(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchScores {
    pub title: f64,
    pub location: f64,
    pub date: f64,
    pub description: f64,
    pub aggregate: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct SimilarityScorer {
    weights: ScoreWeights,
    date_tolerance_minutes: f64,
    date_window_minutes: f64,
    location_base: f64,
    geo_cutoff_km: f64,
}

impl SimilarityScorer {
    pub fn new(config: &ScoringConfig) -> Self {
        Self {
            weights: config.weights,
            date_tolerance_minutes: f64::from(config.date_tolerance_minutes),
            date_window_minutes: f64::from(config.date_window_hours) * 60.0,
            location_base: config.location_base,
            geo_cutoff_km: config.geo_cutoff_km,
        }
    }

    pub fn score<A, B>(&self, a: &A, b: &B) -> MatchScores
    where
        A: EventView + ?Sized,
        B: EventView + ?Sized,
    {
        let title = title_similarity(a.title(), b.title());
        let location = self.location_similarity(a.location(), b.location());
        let date = self.date_similarity(a.start(), b.start());
        let description = description_similarity(a.description(), b.description());
        let w = &self.weights;
        let aggregate = w.title * title
            + w.location * location
            + w.date * date
            + w.description * description;
        MatchScores {
            title,
            location,
            date,
            description,
            aggregate: aggregate.clamp(0.0, 1.0),
        }
    }

    pub fn date_similarity(&self, a: DateTime<Utc>, b: DateTime<Utc>) -> f64 {
        let minutes = (a - b).num_seconds().unsigned_abs() as f64 / 60.0;
        if minutes <= self.date_tolerance_minutes {
            return 1.0;
        }
        if minutes >= self.date_window_minutes {
            return 0.0;
        }
        let span = self.date_window_minutes - self.date_tolerance_minutes;
        (1.0 - (minutes - self.date_tolerance_minutes) / span).clamp(0.0, 1.0)
    }

    pub fn location_similarity(&self, a: &EventLocation, b: &EventLocation) -> f64 {
        let geo = match (a.coordinates(), b.coordinates()) {
            (Some(pa), Some(pb)) => Some(self.geo_proximity(pa, pb)),
            _ => None,
        };

        let city_a = a.city_key();
        let same_city = !city_a.is_empty() && city_a == b.city_key();
        // Country spellings vary by source ("US", "USA"), so only city and state gate the match.
        if !same_city || differs(a.state.as_deref(), b.state.as_deref()) {
            return geo.map(|g| g * self.location_base).unwrap_or(0.0);
        }

        let mut refinements = Vec::with_capacity(3);
        if let (Some(va), Some(vb)) = (present(&a.venue), present(&b.venue)) {
            refinements.push(jaccard(&token_set(va), &token_set(vb)));
        }
        if let (Some(aa), Some(ab)) = (present(&a.address), present(&b.address)) {
            refinements.push(jaccard(&token_set(aa), &token_set(ab)));
        }
        if let Some(g) = geo {
            refinements.push(g);
        }
        if refinements.is_empty() {
            return 1.0;
        }
        let mean = refinements.iter().sum::<f64>() / refinements.len() as f64;
        self.location_base + (1.0 - self.location_base) * mean
    }

    /// 1.0 at the same point, falling linearly to 0 at the cutoff radius.
    fn geo_proximity(&self, a: (f64, f64), b: (f64, f64)) -> f64 {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        let distance = haversine_km(first.0, first.1, second.0, second.1);
        (1.0 - distance / self.geo_cutoff_km).clamp(0.0, 1.0)
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Both present and different after normalization.
fn differs(a: Option<&str>, b: Option<&str>) -> bool {
    match (a.map(normalize_city), b.map(normalize_city)) {
        (Some(a), Some(b)) => !a.is_empty() && !b.is_empty() && a != b,
        _ => false,
    }
}

pub fn haversine_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

/// Unigrams plus adjacent-word bigrams, so word order counts for something.
pub fn title_shingles(title: &str) -> BTreeSet<String> {
    let words = tokens(title);
    let mut shingles = words.iter().cloned().collect::<BTreeSet<_>>();
    for pair in words.windows(2) {
        shingles.insert(format!("{} {}", pair[0], pair[1]));
    }
    shingles
}

pub fn title_similarity(a: &str, b: &str) -> f64 {
    let normalized = normalize_text(a);
    if !normalized.is_empty() && normalized == normalize_text(b) {
        return 1.0;
    }
    jaccard(&title_shingles(a), &title_shingles(b))
}

pub fn description_similarity(a: &str, b: &str) -> f64 {
    jaccard(&token_set(a), &token_set(b))
}
