//! Candidate production from the upstream ranking feed.
//!
//! The publisher exposes its table data as a JSON payload (rows under a
//! `data` key or a bare array). Row titles arrive as small HTML fragments
//! carrying the institution name and a profile link; everything else is
//! plain columns. Locating that payload URL on the ranking page is a
//! separate concern; callers hand the endpoint in.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, REFERER};
use reqwest::Url;
use scraper::{Html, Selector};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info};
use unirank_core::{normalize_rank, Candidate, RankText};
use unirank_fetch::{FetchError, RateLimitedTransport};

#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("feed payload is not valid JSON: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("feed payload has no row array")]
    Shape,
}

/// A finite supply of candidates for one crawl batch. An error from the
/// supply aborts the whole job; per-candidate problems downstream do not.
#[async_trait]
pub trait CandidateSource: Send {
    async fn next_candidate(&mut self) -> anyhow::Result<Option<Candidate>>;
}

/// Client for one ranking feed endpoint.
pub struct RankingFeed {
    transport: Arc<RateLimitedTransport>,
    main_url: String,
    referer: Option<String>,
    max_rank: Option<i64>,
}

impl RankingFeed {
    pub fn new(transport: Arc<RateLimitedTransport>, main_url: impl Into<String>) -> Self {
        Self {
            transport,
            main_url: main_url.into(),
            referer: None,
            max_rank: None,
        }
    }

    /// Referer header for the fetch; also recorded as `source_url` on every
    /// candidate.
    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }

    /// Keep only rows whose normalized lower bound is at most `max_rank`.
    /// Rows without a parseable rank are dropped when the cutoff is set.
    pub fn with_max_rank(mut self, max_rank: i64) -> Self {
        self.max_rank = Some(max_rank);
        self
    }

    pub fn into_source(self) -> FeedSource {
        FeedSource {
            feed: self,
            buffer: None,
        }
    }

    /// Fetch the payload and convert its rows into candidates, dropping
    /// rows that do not look like institutions.
    pub async fn fetch_candidates(&self) -> Result<Vec<Candidate>, FeedError> {
        let resp = self
            .transport
            .fetch(&self.main_url, self.request_headers())
            .await?;
        let payload: Value = serde_json::from_slice(&resp.body)?;
        let candidates = candidates_from_payload(&payload, self.referer.as_deref(), self.max_rank)
            .ok_or(FeedError::Shape)?;
        info!(
            count = candidates.len(),
            url = %self.main_url,
            "parsed ranking feed"
        );
        Ok(candidates)
    }

    fn request_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/plain, */*"),
        );
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.9"),
        );
        if let Some(referer) = &self.referer {
            if let Ok(value) = HeaderValue::from_str(referer) {
                headers.insert(REFERER, value);
            }
        }
        headers
    }
}

/// Lazy [`CandidateSource`] over a ranking feed: the payload is fetched on
/// the first pull, so feed failures surface inside the job as a production
/// error.
pub struct FeedSource {
    feed: RankingFeed,
    buffer: Option<VecDeque<Candidate>>,
}

#[async_trait]
impl CandidateSource for FeedSource {
    async fn next_candidate(&mut self) -> anyhow::Result<Option<Candidate>> {
        let buffer = match &mut self.buffer {
            Some(buffer) => buffer,
            None => {
                let items = self
                    .feed
                    .fetch_candidates()
                    .await
                    .context("fetching ranking feed")?;
                self.buffer.insert(items.into())
            }
        };
        Ok(buffer.pop_front())
    }
}

/// Fixed in-memory candidate list; used by tests.
pub struct StaticSource {
    items: VecDeque<Candidate>,
}

impl StaticSource {
    pub fn new(items: Vec<Candidate>) -> Self {
        Self {
            items: items.into(),
        }
    }
}

#[async_trait]
impl CandidateSource for StaticSource {
    async fn next_candidate(&mut self) -> anyhow::Result<Option<Candidate>> {
        Ok(self.items.pop_front())
    }
}

fn payload_rows(payload: &Value) -> Option<&Vec<Value>> {
    match payload {
        Value::Array(rows) => Some(rows),
        Value::Object(map) => map.get("data").and_then(Value::as_array),
        _ => None,
    }
}

/// Pure payload-to-candidates conversion, split out from the fetch so it
/// can be exercised against fixture payloads.
fn candidates_from_payload(
    payload: &Value,
    referer: Option<&str>,
    max_rank: Option<i64>,
) -> Option<Vec<Candidate>> {
    let rows = payload_rows(payload)?;
    let origin = referer.and_then(origin_of);

    let mut out = Vec::new();
    let mut dropped = 0usize;
    for row in rows {
        let Some(candidate) = row_to_candidate(row, origin.as_deref(), referer) else {
            dropped += 1;
            continue;
        };
        if let Some(cap) = max_rank {
            match normalize_rank(candidate.rank.as_ref()).lower {
                Some(lower) if lower <= cap => {}
                _ => {
                    dropped += 1;
                    continue;
                }
            }
        }
        out.push(candidate);
    }
    if dropped > 0 {
        debug!(dropped, "dropped feed rows");
    }

    // Rank order keeps repeated runs deterministic; unranked rows sort last.
    out.sort_by(|a, b| {
        let ka = normalize_rank(a.rank.as_ref()).lower.unwrap_or(i64::MAX);
        let kb = normalize_rank(b.rank.as_ref()).lower.unwrap_or(i64::MAX);
        ka.cmp(&kb).then_with(|| a.name.cmp(&b.name))
    });
    Some(out)
}

fn row_to_candidate(row: &Value, origin: Option<&str>, referer: Option<&str>) -> Option<Candidate> {
    let raw_title = row
        .get("title")
        .or_else(|| row.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let (name, href) = title_text_and_link(raw_title);
    if !looks_like_institution(&name) {
        return None;
    }

    let website_url = href.and_then(|h| absolutize(&h, origin));
    let rank = row
        .get("rank_display")
        .or_else(|| row.get("overall_rank"))
        .or_else(|| row.get("rank"))
        .and_then(value_to_rank);

    let mut payload = Map::new();
    payload.insert("row".into(), row.clone());
    for key in ["logo", "region", "nid", "core_id"] {
        if let Some(value) = row.get(key) {
            payload.insert(key.to_string(), value.clone());
        }
    }
    if let Some(object) = row.as_object() {
        let indicators: Map<String, Value> = object
            .iter()
            .filter(|(key, _)| key.starts_with("ind_"))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        if !indicators.is_empty() {
            payload.insert("indicators".into(), Value::Object(indicators));
        }
    }
    payload.insert("feed".into(), json!("ranking-json"));

    Some(Candidate {
        initial: Some(initial_of(&name)),
        kind: Some("University".to_string()),
        country: row
            .get("country")
            .or_else(|| row.get("country_name"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string),
        location: row
            .get("city")
            .or_else(|| row.get("location"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string),
        year_founded: row
            .get("founded")
            .or_else(|| row.get("year_founded"))
            .and_then(value_to_i64),
        rank,
        website_url,
        source_url: referer.map(ToString::to_string),
        confidence_score: Some(0.95),
        payload,
        entity_id: None,
        name,
    })
}

/// Strip the title fragment down to its text and pull the first link.
fn title_text_and_link(html: &str) -> (String, Option<String>) {
    let fragment = Html::parse_fragment(html);
    let text = fragment
        .root_element()
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let href = Selector::parse("a[href]").ok().and_then(|selector| {
        fragment
            .select(&selector)
            .next()
            .and_then(|el| el.value().attr("href"))
            .map(ToString::to_string)
    });
    (text, href)
}

fn value_to_rank(value: &Value) -> Option<RankText> {
    match value {
        Value::Number(n) => n.as_i64().map(RankText::Number),
        Value::String(s) if !s.trim().is_empty() => Some(RankText::Text(s.clone())),
        _ => None,
    }
}

fn value_to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn initial_of(name: &str) -> String {
    name.chars().take(3).collect::<String>().to_uppercase()
}

fn origin_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    match parsed.port() {
        Some(port) => Some(format!("{}://{}:{}", parsed.scheme(), host, port)),
        None => Some(format!("{}://{}", parsed.scheme(), host)),
    }
}

fn absolutize(href: &str, origin: Option<&str>) -> Option<String> {
    if href.starts_with("http://") || href.starts_with("https://") {
        return Some(href.to_string());
    }
    if href.starts_with('/') {
        return origin.map(|o| format!("{o}{href}"));
    }
    None
}

const NOISE_PATTERNS: &[&str] = &[
    "rankings",
    "ranking",
    "top universities",
    "world university",
    "best universities",
    "higher education",
    "advertisement",
    "sponsored",
    "promoted",
    "click here",
    "learn more",
];

// English terms plus common multilingual roots; the bare "univers" root
// covers most Romance and Germanic spellings.
const INSTITUTION_KEYWORDS: &[&str] = &[
    "university",
    "college",
    "institute",
    "academy",
    "school",
    "polytechnic",
    "univers",
    "universidad",
    "universidade",
    "universität",
    "universiteit",
    "universitat",
    "universitas",
    "universitet",
    "univerzita",
    "école",
    "ecole",
    "institut",
    "大学",
    "大學",
    "学院",
    "學院",
    "대학교",
    "대학",
];

// Safety net for institutions commonly written without any keyword.
const FAMOUS_SHORT_NAMES: &[&str] = &[
    "mit",
    "harvard",
    "stanford",
    "oxford",
    "cambridge",
    "caltech",
    "eth zurich",
    "ucl",
    "tsinghua",
    "kaist",
];

fn looks_like_institution(name: &str) -> bool {
    if name.chars().count() < 3 {
        return false;
    }
    let lower = name.to_lowercase();
    if NOISE_PATTERNS.iter().any(|noise| lower.contains(noise)) {
        return false;
    }
    if INSTITUTION_KEYWORDS
        .iter()
        .any(|keyword| lower.contains(keyword))
    {
        return true;
    }
    FAMOUS_SHORT_NAMES
        .iter()
        .any(|famous| lower.contains(famous))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> Value {
        json!({
            "data": [
                {
                    "title": "<a href=\"/universities/example-university\">Example University</a>",
                    "rank_display": "=5",
                    "country": "Freedonia",
                    "city": "City X",
                    "region": "Europe",
                    "ind_76": "97.3",
                    "nid": 1234
                },
                {
                    "title": "<a href=\"https://other.example.org/profile\">Other Institute of Technology</a>",
                    "rank_display": "201-250",
                    "country": "Sylvania"
                },
                {
                    "title": "World University Rankings 2026",
                    "rank_display": "1"
                }
            ]
        })
    }

    #[test]
    fn payload_rows_accepts_object_and_bare_array() {
        assert!(payload_rows(&sample_payload()).is_some());
        assert!(payload_rows(&json!([{"title": "x"}])).is_some());
        assert!(payload_rows(&json!("nope")).is_none());
        assert!(payload_rows(&json!({"other": []})).is_none());
    }

    #[test]
    fn rows_become_candidates_and_noise_is_dropped() {
        let referer = "https://rankings.example.com/en/world/2026";
        let candidates =
            candidates_from_payload(&sample_payload(), Some(referer), None).expect("rows");

        assert_eq!(candidates.len(), 2, "headline row should be dropped");
        let first = &candidates[0];
        assert_eq!(first.name, "Example University");
        assert_eq!(first.rank, Some(RankText::Text("=5".into())));
        assert_eq!(
            first.website_url.as_deref(),
            Some("https://rankings.example.com/universities/example-university")
        );
        assert_eq!(first.country.as_deref(), Some("Freedonia"));
        assert_eq!(first.location.as_deref(), Some("City X"));
        assert_eq!(first.source_url.as_deref(), Some(referer));
        assert_eq!(first.initial.as_deref(), Some("EXA"));
        assert_eq!(first.confidence_score, Some(0.95));
        assert_eq!(first.payload.get("region"), Some(&json!("Europe")));
        assert_eq!(
            first.payload.get("indicators"),
            Some(&json!({"ind_76": "97.3"}))
        );
        assert!(first.payload.contains_key("row"));

        let second = &candidates[1];
        assert_eq!(
            second.website_url.as_deref(),
            Some("https://other.example.org/profile"),
            "absolute links pass through untouched"
        );
    }

    #[test]
    fn max_rank_cutoff_uses_the_lower_bound() {
        let payload = json!([
            {"title": "Alpha University", "rank_display": "195-210"},
            {"title": "Beta University", "rank_display": "205"},
            {"title": "Gamma University", "rank_display": "Unranked"}
        ]);
        let kept = candidates_from_payload(&payload, None, Some(200)).expect("rows");
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "Alpha University");
    }

    #[test]
    fn candidates_sort_by_normalized_rank() {
        let payload = json!([
            {"title": "Delta University", "rank_display": "301-350"},
            {"title": "Alpha University", "rank_display": "=2"},
            {"title": "Unranked College"}
        ]);
        let candidates = candidates_from_payload(&payload, None, None).expect("rows");
        let names: Vec<_> = candidates.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["Alpha University", "Delta University", "Unranked College"]
        );
    }

    #[test]
    fn institution_filter_is_multilingual_and_blocks_noise() {
        assert!(looks_like_institution("Université de Sylvanie"));
        assert!(looks_like_institution("Technische Universität Beispiel"));
        assert!(looks_like_institution("清华大学"));
        assert!(looks_like_institution("MIT"));
        assert!(!looks_like_institution("World University Rankings 2026"));
        assert!(!looks_like_institution("Sponsored: study abroad"));
        assert!(!looks_like_institution("ab"));
    }

    #[test]
    fn title_fragment_yields_text_and_first_link() {
        let (text, href) =
            title_text_and_link("<div><a href=\"/u/x\">Example  University</a></div>");
        assert_eq!(text, "Example University");
        assert_eq!(href.as_deref(), Some("/u/x"));

        let (plain, none) = title_text_and_link("Plain Name University");
        assert_eq!(plain, "Plain Name University");
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn static_source_drains_in_order() {
        let mut source = StaticSource::new(vec![
            Candidate {
                name: "A University".into(),
                ..Candidate::default()
            },
            Candidate {
                name: "B University".into(),
                ..Candidate::default()
            },
        ]);
        let first = source.next_candidate().await.expect("ok").expect("first");
        assert_eq!(first.name, "A University");
        let second = source.next_candidate().await.expect("ok").expect("second");
        assert_eq!(second.name, "B University");
        assert!(source.next_candidate().await.expect("ok").is_none());
    }
}
