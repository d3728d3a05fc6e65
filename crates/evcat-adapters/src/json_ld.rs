use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use evcat_core::{EventLocation, RawEventRecord, SourceError, SourceProvenance};
use evcat_storage::HttpClient;
use scraper::{Html, Selector};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{FetchQuery, SourceAdapter};

/// Fetches listing pages and extracts schema.org `Event` objects embedded as JSON-LD.
#[derive(Debug, Clone)]
pub struct JsonLdAdapter {
    platform: String,
    urls: Vec<String>,
    http: HttpClient,
}

impl JsonLdAdapter {
    pub fn new(platform: impl Into<String>, urls: Vec<String>, http: HttpClient) -> Self {
        Self {
            platform: platform.into(),
            urls,
            http,
        }
    }
}

#[async_trait]
impl SourceAdapter for JsonLdAdapter {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn fetch_events(&self, query: &FetchQuery) -> Result<Vec<RawEventRecord>, SourceError> {
        let slug = query.city_slug();
        let mut records = Vec::new();
        for template in &self.urls {
            let url = template.replace("{city}", &slug);
            let body = {
                let session = self.http.session().await?;
                session.get_text(&url).await?
            };
            let page = parse_json_ld_events(&body, &url, &self.platform, query, Utc::now())?;
            debug!(platform = %self.platform, url = %url, events = page.len(), "parsed json-ld page");
            records.extend(page);
            if records.len() >= query.limit {
                break;
            }
        }
        records.truncate(query.limit);
        Ok(records)
    }
}

/// Extract events from every `application/ld+json` block in `html`.
///
/// Events without a name or a parseable start date are skipped, as are events
/// located in a different city than `query`. Events with no locality inherit the
/// query's city. Malformed blocks are logged and ignored.
pub fn parse_json_ld_events(
    html: &str,
    page_url: &str,
    platform: &str,
    query: &FetchQuery,
    scraped_at: DateTime<Utc>,
) -> Result<Vec<RawEventRecord>, SourceError> {
    let selector = Selector::parse(r#"script[type="application/ld+json"]"#)
        .map_err(|e| SourceError::parse(e.to_string()))?;
    let document = Html::parse_document(html);

    let mut nodes = Vec::new();
    for script in document.select(&selector) {
        let text = script.text().collect::<String>();
        match serde_json::from_str::<JsonValue>(text.trim()) {
            Ok(value) => collect_nodes(value, &mut nodes),
            Err(err) => warn!(url = page_url, error = %err, "skipping malformed json-ld block"),
        }
    }

    let city_key = evcat_core::text::normalize_city(&query.city);
    let mut records = Vec::new();
    for node in nodes.iter().filter(|n| is_event(n)) {
        let Some(record) = event_from_node(node, page_url, platform, query, scraped_at) else {
            continue;
        };
        if record.location.city_key() == city_key {
            records.push(record);
        }
    }
    Ok(records)
}

fn collect_nodes(value: JsonValue, out: &mut Vec<JsonValue>) {
    match value {
        JsonValue::Array(items) => items.into_iter().for_each(|v| collect_nodes(v, out)),
        JsonValue::Object(mut map) => {
            if let Some(graph) = map.remove("@graph") {
                collect_nodes(graph, out);
            }
            if !map.is_empty() {
                out.push(JsonValue::Object(map));
            }
        }
        _ => {}
    }
}

fn is_event(node: &JsonValue) -> bool {
    let is_event_type = |t: &str| t == "Event" || t.ends_with("Event");
    match node.get("@type") {
        Some(JsonValue::String(t)) => is_event_type(t),
        Some(JsonValue::Array(types)) => types.iter().filter_map(JsonValue::as_str).any(is_event_type),
        _ => false,
    }
}

fn str_at<'a>(value: &'a JsonValue, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn f64_at(value: &JsonValue, key: &str) -> Option<f64> {
    match value.get(key)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// First element of an array, or the value itself.
fn first(value: &JsonValue) -> &JsonValue {
    match value {
        JsonValue::Array(items) => items.first().unwrap_or(value),
        other => other,
    }
}

fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn event_from_node(
    node: &JsonValue,
    page_url: &str,
    platform: &str,
    query: &FetchQuery,
    scraped_at: DateTime<Utc>,
) -> Option<RawEventRecord> {
    let title = str_at(node, "name")?.to_string();
    let start_time = str_at(node, "startDate").and_then(parse_datetime)?;
    let end_time = str_at(node, "endDate").and_then(parse_datetime);

    let url = str_at(node, "url")
        .map(str::to_string)
        .unwrap_or_else(|| fallback_url(node, page_url, &title, start_time));

    Some(RawEventRecord {
        title,
        description: str_at(node, "description").unwrap_or_default().to_string(),
        start_time,
        end_time,
        location: location_from(node.get("location").map(first), query),
        price: node.get("offers").map(first).and_then(price_from),
        category: None,
        tags: keywords(node),
        provenance: SourceProvenance {
            platform: platform.to_string(),
            url,
            scraped_at,
            source_id: str_at(node, "@id").map(str::to_string),
        },
    })
}

/// Provenance url for an event the page does not link. Built from `@id`, or from
/// the name and start so it survives reordering of the page.
fn fallback_url(node: &JsonValue, page_url: &str, title: &str, start: DateTime<Utc>) -> String {
    match str_at(node, "@id") {
        Some(id) if id.starts_with("http://") || id.starts_with("https://") => id.to_string(),
        Some(id) => format!("{page_url}#{id}"),
        None => {
            let mut hasher = Sha256::new();
            hasher.update(evcat_core::text::normalize_text(title).as_bytes());
            hasher.update(b"|");
            hasher.update(start.to_rfc3339().as_bytes());
            let digest = hex::encode(hasher.finalize());
            format!("{page_url}#event-{}", &digest[..16])
        }
    }
}

fn location_from(place: Option<&JsonValue>, query: &FetchQuery) -> EventLocation {
    let mut location = EventLocation::new("", "");
    if let Some(place) = place {
        match place {
            JsonValue::String(text) => location.address = evcat_core::text::non_empty(text),
            _ => {
                location.venue = str_at(place, "name").map(str::to_string);
                match place.get("address") {
                    Some(JsonValue::String(text)) => {
                        location.address = evcat_core::text::non_empty(text)
                    }
                    Some(address) => {
                        location.address = str_at(address, "streetAddress").map(str::to_string);
                        location.city = str_at(address, "addressLocality").unwrap_or_default().to_string();
                        location.state = str_at(address, "addressRegion").map(str::to_string);
                        location.country = match address.get("addressCountry") {
                            Some(JsonValue::String(c)) => c.trim().to_string(),
                            Some(country) => str_at(country, "name").unwrap_or_default().to_string(),
                            None => String::new(),
                        };
                    }
                    None => {}
                }
                if let Some(geo) = place.get("geo") {
                    location.lat = f64_at(geo, "latitude");
                    location.lon = f64_at(geo, "longitude");
                }
            }
        }
    }

    location.fill_gaps(&EventLocation {
        state: query.state.clone(),
        ..EventLocation::new(query.city.clone(), query.country.clone())
    });
    location
}

fn price_from(offer: &JsonValue) -> Option<String> {
    let currency = str_at(offer, "priceCurrency");
    let price = match offer.get("price") {
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        Some(JsonValue::String(s)) => evcat_core::text::non_empty(s),
        _ => None,
    }?;
    if price.parse::<f64>().map(|p| p == 0.0).unwrap_or(false) {
        return Some("Free".to_string());
    }
    Some(match currency {
        Some(currency) => format!("{price} {currency}"),
        None => price,
    })
}

fn keywords(node: &JsonValue) -> Vec<String> {
    match node.get("keywords") {
        Some(JsonValue::String(s)) => s
            .split(',')
            .filter_map(evcat_core::text::non_empty)
            .collect(),
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(JsonValue::as_str)
            .filter_map(evcat_core::text::non_empty)
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const PAGE: &str = r#"<!doctype html>
<html><head>
<script type="application/ld+json">
{"@context": "https://schema.org", "@graph": [
  {"@type": "Organization", "name": "Hosts Inc"},
  {"@type": "MusicEvent", "@id": "evt-7", "name": "Jazz in the Park",
   "startDate": "2025-10-20T18:00:00-04:00", "endDate": "2025-10-20T21:00:00-04:00",
   "url": "https://venue.test/jazz",
   "description": "An evening of live jazz",
   "keywords": "music, jazz, outdoor",
   "location": {"@type": "Place", "name": "Bryant Park",
     "address": {"@type": "PostalAddress", "streetAddress": "42nd St",
       "addressLocality": "New York", "addressRegion": "NY", "addressCountry": "US"},
     "geo": {"latitude": "40.7536", "longitude": -73.9832}},
   "offers": [{"price": 0, "priceCurrency": "USD"}]}
]}
</script>
<script type="application/ld+json">{ broken json </script>
<script type="application/ld+json">
[{"@type": ["Event"], "name": "Rust Meetup", "startDate": "2025-10-22",
  "offers": {"price": "15.00", "priceCurrency": "USD"}},
 {"@type": "Event", "name": "Elsewhere", "startDate": "2025-10-22T19:00",
  "location": {"address": {"addressLocality": "Boston"}}},
 {"@type": "Event", "startDate": "2025-10-22T19:00"}]
</script>
</head><body></body></html>"#;

    fn parse() -> Vec<RawEventRecord> {
        let scraped = Utc.with_ymd_and_hms(2025, 10, 1, 0, 0, 0).unwrap();
        parse_json_ld_events(
            PAGE,
            "https://venue.test/nyc",
            "venue_site",
            &FetchQuery::new("New York", "US", 10),
            scraped,
        )
        .unwrap()
    }

    #[test]
    fn extracts_event_subtypes_from_graph_and_arrays() {
        let records = parse();
        let titles = records.iter().map(|r| r.title.as_str()).collect::<Vec<_>>();
        assert_eq!(titles, vec!["Jazz in the Park", "Rust Meetup"]);
    }

    #[test]
    fn maps_place_offers_and_keywords() {
        let jazz = &parse()[0];
        assert_eq!(jazz.start_time, Utc.with_ymd_and_hms(2025, 10, 20, 22, 0, 0).unwrap());
        assert_eq!(jazz.location.venue.as_deref(), Some("Bryant Park"));
        assert_eq!(jazz.location.state.as_deref(), Some("NY"));
        assert_eq!(jazz.location.coordinates(), Some((40.7536, -73.9832)));
        assert_eq!(jazz.price.as_deref(), Some("Free"));
        assert_eq!(jazz.tags, vec!["music", "jazz", "outdoor"]);
        assert_eq!(jazz.provenance.url, "https://venue.test/jazz");
        assert_eq!(jazz.provenance.source_id.as_deref(), Some("evt-7"));
    }

    #[test]
    fn events_without_url_or_locality_fall_back_to_page_and_query() {
        let meetup = &parse()[1];
        assert_eq!(meetup.location.city, "New York");
        assert_eq!(meetup.price.as_deref(), Some("15.00 USD"));
        assert_eq!(meetup.start_time, Utc.with_ymd_and_hms(2025, 10, 22, 0, 0, 0).unwrap());
        assert!(meetup.provenance.url.starts_with("https://venue.test/nyc#event-"));
    }

    #[test]
    fn unlinked_events_keep_their_key_when_the_page_changes() {
        let scraped = Utc.with_ymd_and_hms(2025, 10, 1, 0, 0, 0).unwrap();
        let query = FetchQuery::new("New York", "US", 10);
        let page = |events: &str| {
            format!(r#"<script type="application/ld+json">[{events}]</script>"#)
        };
        let meetup = r#"{"@type": "Event", "name": "Rust Meetup", "startDate": "2025-10-22T19:00"}"#;
        let anchored = r#"{"@type": "Event", "@id": "talk-3", "name": "Lightning Talks", "startDate": "2025-10-23T19:00"}"#;
        let inserted = r#"{"@type": "Event", "name": "Book Swap", "startDate": "2025-10-21T18:00"}"#;

        let parse = |html: String| {
            parse_json_ld_events(&html, "https://venue.test/nyc", "venue_site", &query, scraped).unwrap()
        };
        let before = parse(page(&format!("{meetup},{anchored}")));
        let after = parse(page(&format!("{inserted},{meetup},{anchored}")));

        assert_eq!(after.len(), 3);
        assert_eq!(before[0].provenance.url, after[1].provenance.url);
        assert_eq!(before[1].provenance.url, "https://venue.test/nyc#talk-3");
        assert_eq!(before[1].provenance.url, after[2].provenance.url);
        assert_ne!(after[0].provenance.url, after[1].provenance.url);
    }
}
