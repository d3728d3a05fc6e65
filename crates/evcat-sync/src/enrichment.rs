//! Post-persistence enrichment: keyword rules that suggest a category and tags.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use evcat_core::text::tokens;
use evcat_core::{Attributed, CanonicalEvent, FieldEvidence};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const ENRICHMENT_PLATFORM: &str = "enrichment";

/// Rule hits never outrank a value supplied by a source.
const RULE_CONFIDENCE: f64 = 0.3;
const DEFAULT_MAX_TAGS: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub confidence: f64,
}

impl Enrichment {
    pub fn is_empty(&self) -> bool {
        self.category.is_none() && self.tags.is_empty()
    }
}

pub trait EnrichmentHook: Send + Sync {
    fn name(&self) -> &str;
    fn enrich(&self, event: &CanonicalEvent) -> Result<Enrichment>;
}

#[derive(Debug, Default)]
pub struct NoopEnrichmentHook;

impl EnrichmentHook for NoopEnrichmentHook {
    fn name(&self) -> &str {
        "noop"
    }

    fn enrich(&self, _event: &CanonicalEvent) -> Result<Enrichment> {
        Ok(Enrichment::default())
    }
}

/// Fold `enrichment` into `event`. A category is only filled when missing; tags are
/// unioned. Returns whether anything changed.
pub fn apply_enrichment(
    event: &mut CanonicalEvent,
    enrichment: &Enrichment,
    source: &str,
    at: DateTime<Utc>,
) -> bool {
    if enrichment.is_empty() {
        return false;
    }
    let mut changed = false;
    if event.category.is_none() {
        if let Some(category) = &enrichment.category {
            event.category = Some(Attributed::new(
                category.clone(),
                FieldEvidence {
                    platform: ENRICHMENT_PLATFORM.to_string(),
                    url: format!("rules:{source}"),
                    confidence: enrichment.confidence,
                },
            ));
            changed = true;
        }
    }
    for tag in &enrichment.tags {
        let tag = tag.trim().to_lowercase();
        if !tag.is_empty() && !event.tags.contains(&tag) {
            event.tags.push(tag);
            changed = true;
        }
    }
    if changed {
        event.tags.sort();
        event.enrichment_confidence = Some(enrichment.confidence);
        event.updated_at = at;
    }
    changed
}

#[derive(Debug, Clone, Deserialize)]
struct CategoryRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<CategoryRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct CategoryRule {
    category: String,
    contains_any: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct TagRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    max_tags: Option<usize>,
    #[serde(default)]
    rules: Vec<TagRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct TagRule {
    tag: String,
    contains_any: Vec<String>,
}

/// First matching category rule wins; every matching tag rule adds its tag.
#[derive(Debug, Clone)]
pub struct RuleEnrichmentHook {
    categories: Vec<CategoryRule>,
    tags: Vec<TagRule>,
    max_tags: usize,
}

impl RuleEnrichmentHook {
    /// Reads `categories.yaml` and `tags.yaml` from `rules_dir`.
    pub fn load(rules_dir: &Path) -> Result<Self> {
        let categories_path = rules_dir.join("categories.yaml");
        let categories: CategoryRulesFile = serde_yaml::from_str(
            &std::fs::read_to_string(&categories_path)
                .with_context(|| format!("reading {}", categories_path.display()))?,
        )
        .with_context(|| format!("parsing {}", categories_path.display()))?;
        let tags_path = rules_dir.join("tags.yaml");
        let tags: TagRulesFile = serde_yaml::from_str(
            &std::fs::read_to_string(&tags_path)
                .with_context(|| format!("reading {}", tags_path.display()))?,
        )
        .with_context(|| format!("parsing {}", tags_path.display()))?;
        Ok(Self {
            categories: categories.rules,
            tags: tags.rules,
            max_tags: tags.max_tags.unwrap_or(DEFAULT_MAX_TAGS),
        })
    }

    /// [`Self::load`] when `rules_dir` exists, the built-in rules otherwise.
    pub fn load_or_builtin(rules_dir: &Path) -> Result<Self> {
        if rules_dir.join("categories.yaml").exists() {
            return Self::load(rules_dir);
        }
        info!(rules_dir = %rules_dir.display(), "no rule files found, using built-in enrichment rules");
        Ok(Self::builtin())
    }

    pub fn builtin() -> Self {
        let category = |category: &str, words: &[&str]| CategoryRule {
            category: category.to_string(),
            contains_any: words.iter().map(|w| w.to_string()).collect(),
        };
        let tag = |tag: &str, words: &[&str]| TagRule {
            tag: tag.to_string(),
            contains_any: words.iter().map(|w| w.to_string()).collect(),
        };
        Self {
            categories: vec![
                category("Technology & IT", &["tech", "software", "programming", "coding", "ai", "data"]),
                category("Business & Networking", &["business", "networking", "startup", "entrepreneur"]),
                category("Music & Entertainment", &["music", "concert", "band", "dj"]),
                category("Arts & Culture", &["art", "gallery", "museum", "culture"]),
                category("Sports & Fitness", &["sport", "fitness", "gym", "running", "yoga"]),
                category("Food & Drink", &["food", "restaurant", "cooking", "wine", "beer"]),
                category("Education & Training", &["education", "course", "training", "workshop", "seminar"]),
                category("Health & Wellness", &["health", "wellness", "medical", "therapy"]),
            ],
            tags: vec![
                tag("meetup", &["meetup", "meeting"]),
                tag("conference", &["conference", "summit"]),
                tag("workshop", &["workshop", "training"]),
                tag("networking", &["networking", "social"]),
                tag("free", &["free", "no cost"]),
            ],
            max_tags: DEFAULT_MAX_TAGS,
        }
    }
}

/// `needle` matches when its words appear consecutively in `words`.
fn contains_phrase(words: &[String], needle: &str) -> bool {
    let phrase = tokens(needle);
    !phrase.is_empty() && words.windows(phrase.len()).any(|w| w == phrase.as_slice())
}

impl EnrichmentHook for RuleEnrichmentHook {
    fn name(&self) -> &str {
        "keyword-rules"
    }

    fn enrich(&self, event: &CanonicalEvent) -> Result<Enrichment> {
        let words = tokens(&format!("{} {}", event.title(), event.description()));
        let matches = |needles: &[String]| needles.iter().any(|n| contains_phrase(&words, n));

        let category = self
            .categories
            .iter()
            .find(|rule| matches(&rule.contains_any))
            .map(|rule| rule.category.clone());
        let tags = self
            .tags
            .iter()
            .filter(|rule| matches(&rule.contains_any))
            .map(|rule| rule.tag.clone())
            .take(self.max_tags)
            .collect::<Vec<_>>();

        Ok(Enrichment {
            category,
            tags,
            confidence: RULE_CONFIDENCE,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use evcat_core::{EventLocation, RawEventRecord, SourceProvenance};

    fn event(title: &str, description: &str, category: Option<&str>) -> CanonicalEvent {
        let at = Utc.with_ymd_and_hms(2025, 10, 20, 18, 0, 0).unwrap();
        let record = RawEventRecord {
            title: title.into(),
            description: description.into(),
            start_time: at,
            end_time: None,
            location: EventLocation::new("Austin", "US"),
            price: None,
            category: category.map(str::to_string),
            tags: vec!["existing".into()],
            provenance: SourceProvenance {
                platform: "meetup".into(),
                url: "https://meetup.test/1".into(),
                scraped_at: at,
                source_id: None,
            },
        };
        CanonicalEvent::from_record(&record, 0.8, at)
    }

    #[test]
    fn builtin_rules_match_whole_words() {
        let hook = RuleEnrichmentHook::builtin();
        let e = hook
            .enrich(&event("Rust Programming Meetup", "Free pizza and networking", None))
            .unwrap();
        assert_eq!(e.category.as_deref(), Some("Technology & IT"));
        assert_eq!(e.tags, vec!["meetup", "networking", "free"]);

        // "said" must not trigger the "ai" keyword.
        let e = hook.enrich(&event("Poetry night", "She said hello", None)).unwrap();
        assert!(e.is_empty());
    }

    #[test]
    fn multi_word_keywords_match_as_phrases() {
        let hook = RuleEnrichmentHook::builtin();
        let e = hook.enrich(&event("Open studio", "No cost to attend", None)).unwrap();
        assert_eq!(e.tags, vec!["free"]);
        let e = hook.enrich(&event("Open studio", "cost: no", None)).unwrap();
        assert!(e.tags.is_empty());
    }

    #[test]
    fn apply_keeps_source_category_and_unions_tags() {
        let at = Utc.with_ymd_and_hms(2025, 10, 21, 0, 0, 0).unwrap();
        let mut sourced = event("Jazz concert", "", Some("Live Music"));
        let enrichment = Enrichment {
            category: Some("Music & Entertainment".into()),
            tags: vec!["Concert".into(), "existing".into()],
            confidence: RULE_CONFIDENCE,
        };
        assert!(apply_enrichment(&mut sourced, &enrichment, "keyword-rules", at));
        assert_eq!(sourced.category.as_ref().map(|c| c.value.as_str()), Some("Live Music"));
        assert_eq!(sourced.tags, vec!["concert", "existing"]);
        assert_eq!(sourced.enrichment_confidence, Some(RULE_CONFIDENCE));

        let mut bare = event("Jazz concert", "", None);
        apply_enrichment(&mut bare, &enrichment, "keyword-rules", at);
        let category = bare.category.unwrap();
        assert_eq!(category.value, "Music & Entertainment");
        assert_eq!(category.evidence.platform, ENRICHMENT_PLATFORM);

        let mut unchanged = event("Jazz concert", "", Some("Live Music"));
        assert!(!apply_enrichment(&mut unchanged, &Enrichment::default(), "noop", at));
        assert_eq!(unchanged.enrichment_confidence, None);
    }

    #[test]
    fn loads_rule_files_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("categories.yaml"),
            "version: 1\nrules:\n  - category: Outdoors\n    contains_any: [hike, trail run]\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("tags.yaml"),
            "version: 1\nmax_tags: 1\nrules:\n  - tag: nature\n    contains_any: [hike]\n  - tag: group\n    contains_any: [hike]\n",
        )
        .unwrap();
        let hook = RuleEnrichmentHook::load(dir.path()).unwrap();
        let e = hook.enrich(&event("Sunday Trail Run", "and a short hike", None)).unwrap();
        assert_eq!(e.category.as_deref(), Some("Outdoors"));
        assert_eq!(e.tags, vec!["nature"]);

        let missing = RuleEnrichmentHook::load(&dir.path().join("nope"));
        assert!(missing.is_err());
        assert!(RuleEnrichmentHook::load_or_builtin(&dir.path().join("nope")).is_ok());
    }
}
