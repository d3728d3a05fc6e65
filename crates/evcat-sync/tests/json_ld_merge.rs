use std::net::SocketAddr;
use std::sync::Arc;

use evcat_adapters::{AdapterContext, SourceKind};
use evcat_storage::{HttpClient, HttpClientConfig, MemoryGateway, TokenBucketConfig};
use evcat_sync::{CatalogConfig, CollectionCycle, LocationConfig, SourceConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const CLUB_PAGE: &str = r#"<html><head>
<script type="application/ld+json">
{"@context": "https://schema.org", "@type": "Event",
 "name": "Jazz Night", "description": "Live quartet at the Green Mill",
 "startDate": "2025-10-21T20:00:00-05:00",
 "url": "https://clubsite.test/jazz-night",
 "location": {"@type": "Place", "name": "Green Mill",
   "address": {"@type": "PostalAddress", "addressLocality": "Chicago",
     "addressRegion": "IL", "addressCountry": "USA"}}}
</script></head><body></body></html>"#;

const LISTINGS: &str = r#"[
  {"url": "https://listings.test/e/77", "title": "Jazz Night",
   "description": "Live quartet at the Green Mill", "start_time": "2025-10-22T01:00:00Z",
   "location": {"city": "Chicago", "state": "IL", "country": "US", "venue": "Green Mill"}}
]"#;

/// Serves `body` as HTML to every connection.
async fn serve(body: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut request = [0u8; 4096];
            let _ = stream.read(&mut request).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: text/html\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });
    addr
}

fn source(name: &str, priority: i32, kind: SourceKind) -> SourceConfig {
    SourceConfig {
        name: name.into(),
        enabled: true,
        priority,
        confidence: 0.7,
        rate_limit: TokenBucketConfig::default(),
        kind,
    }
}

#[tokio::test]
async fn scraped_page_and_listing_file_become_one_event() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("listings.json"), LISTINGS).unwrap();
    let addr = serve(CLUB_PAGE).await;

    let chicago = LocationConfig {
        state: Some("IL".into()),
        ..LocationConfig::new("Chicago", "US")
    };
    let config = CatalogConfig {
        sources: vec![
            source("listings", 10, SourceKind::Fixture { path: "listings.json".into() }),
            source(
                "clubsite",
                0,
                SourceKind::JsonLd {
                    urls: vec![format!("http://{addr}/{{city}}/events")],
                },
            ),
        ],
        locations: vec![chicago.clone()],
        ..CatalogConfig::default()
    };
    let http = HttpClient::new(HttpClientConfig::default()).unwrap();
    let ctx = AdapterContext::new(http, dir.path());
    let cycle = CollectionCycle::from_config(&config, &ctx, Arc::new(MemoryGateway::new())).unwrap();

    let sources = cycle.select_sources(&[]).unwrap();
    let run = cycle.run_detailed(&[chicago], &sources).await.unwrap();

    assert!(run.report.source_failures.is_empty(), "{:?}", run.report.source_failures);
    assert_eq!(run.report.records_fetched, 2);
    assert_eq!(run.report.canonical_created, 1);
    assert_eq!(run.report.auto_merged, 1);
    assert_eq!(run.report.pending_review, 0);

    assert_eq!(run.events.len(), 1);
    let jazz = &run.events[0];
    assert_eq!(jazz.sources.len(), 2);
    let platforms: Vec<&str> = jazz.sources.iter().map(|p| p.platform.as_str()).collect();
    assert_eq!(platforms, vec!["listings", "clubsite"]);
    assert_eq!(jazz.location().city, "Chicago");
}
