//! Insert-or-enrich reconciliation of candidates against the catalogue.
//!
//! Matching is deliberately simple: exact id, then substring on website
//! URL, then substring on name. Near-duplicate names therefore create
//! duplicate rows and generous substrings can match unrelated rows; callers
//! rely on this exact behavior, so any move to fuzzier matching is a
//! breaking change.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, warn};
use unirank_core::{normalize_rank, Candidate, Institution, RankValue, ReconcileOutcome,
    STATUS_PENDING};
use unirank_store::{EntityFilter, RecordStore, StoreError};

/// Merge discipline applied to an existing row's scalar fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FillPolicy {
    /// Write a field only when the stored value is empty.
    #[default]
    IfEmpty,
    /// Write any non-empty incoming value unconditionally.
    Overwrite,
}

/// Keys the rank triple occupies inside the auxiliary payload.
const RANK_DISPLAY_KEY: &str = "rank_display";
const RANK_LOWER_KEY: &str = "rank_lower";
const RANK_UPPER_KEY: &str = "rank_upper";

pub struct ReconcileEngine {
    store: Arc<dyn RecordStore>,
}

impl ReconcileEngine {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Decide insert vs. enrich vs. skip for one candidate and apply it.
    ///
    /// Running this twice with the same candidate yields `Inserted` then
    /// `Skipped`: the second call matches the first-created row and finds
    /// every field it could supply already populated.
    pub async fn reconcile(
        &self,
        candidate: &Candidate,
        policy: FillPolicy,
    ) -> Result<ReconcileOutcome, StoreError> {
        let rank = normalize_rank(candidate.rank.as_ref());
        match self.find_match(candidate).await? {
            Some(existing) => self.enrich(candidate, &rank, existing, policy).await,
            None => self.insert(candidate, &rank).await,
        }
    }

    async fn find_match(&self, candidate: &Candidate) -> Result<Option<Institution>, StoreError> {
        let mut filters = Vec::new();
        if let Some(id) = candidate.entity_id {
            filters.push(EntityFilter::Id(id));
        }
        if let Some(url) = non_blank(candidate.website_url.as_deref()) {
            filters.push(EntityFilter::WebsiteContains(url.to_string()));
        }
        if let Some(name) = non_blank(Some(candidate.name.as_str())) {
            filters.push(EntityFilter::NameContains(name.to_string()));
        }

        for filter in filters {
            if let Some(row) = self.store.find(&filter).await? {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    async fn insert(
        &self,
        candidate: &Candidate,
        rank: &RankValue,
    ) -> Result<ReconcileOutcome, StoreError> {
        let mut fields = Map::new();
        fields.insert("name".into(), json!(candidate.name.trim()));
        stage_string(&mut fields, "initial", candidate.initial.as_deref());
        stage_string(&mut fields, "kind", candidate.kind.as_deref());
        stage_string(&mut fields, "country", candidate.country.as_deref());
        stage_string(&mut fields, "location", candidate.location.as_deref());
        stage_string(&mut fields, "website_url", candidate.website_url.as_deref());
        stage_string(&mut fields, "source_url", candidate.source_url.as_deref());
        if let Some(year) = candidate.year_founded {
            fields.insert("year_founded".into(), json!(year));
        }
        if let Some(lower) = rank.lower {
            fields.insert("rank".into(), json!(lower));
        }
        fields.insert(
            "confidence_score".into(),
            json!(candidate.confidence_score.unwrap_or(0.0)),
        );
        fields.insert(
            "payload".into(),
            Value::Object(merged_payload(&Map::new(), &candidate.payload, rank)),
        );
        fields.insert("status".into(), json!(STATUS_PENDING));

        match self.store.insert(fields).await {
            Ok(id) => Ok(ReconcileOutcome::Inserted(id)),
            Err(err) => {
                warn!(error = %err, name = %candidate.name, "insert rejected, skipping candidate");
                Ok(ReconcileOutcome::Skipped(None))
            }
        }
    }

    async fn enrich(
        &self,
        candidate: &Candidate,
        rank: &RankValue,
        existing: Institution,
        policy: FillPolicy,
    ) -> Result<ReconcileOutcome, StoreError> {
        let mut patch = Map::new();

        stage_scalar(
            &mut patch,
            policy,
            "initial",
            non_blank(existing.initial.as_deref()).is_none(),
            string_value(candidate.initial.as_deref()),
        );
        stage_scalar(
            &mut patch,
            policy,
            "kind",
            non_blank(existing.kind.as_deref()).is_none(),
            string_value(candidate.kind.as_deref()),
        );
        stage_scalar(
            &mut patch,
            policy,
            "country",
            non_blank(existing.country.as_deref()).is_none(),
            string_value(candidate.country.as_deref()),
        );
        stage_scalar(
            &mut patch,
            policy,
            "location",
            non_blank(existing.location.as_deref()).is_none(),
            string_value(candidate.location.as_deref()),
        );
        stage_scalar(
            &mut patch,
            policy,
            "website_url",
            non_blank(existing.website_url.as_deref()).is_none(),
            string_value(candidate.website_url.as_deref()),
        );
        stage_scalar(
            &mut patch,
            policy,
            "source_url",
            non_blank(existing.source_url.as_deref()).is_none(),
            string_value(candidate.source_url.as_deref()),
        );
        stage_scalar(
            &mut patch,
            policy,
            "year_founded",
            existing.year_founded.is_none(),
            candidate.year_founded.map(|y| json!(y)),
        );
        stage_scalar(
            &mut patch,
            policy,
            "confidence_score",
            existing.confidence_score.is_none(),
            candidate.confidence_score.map(|c| json!(c)),
        );
        stage_scalar(
            &mut patch,
            policy,
            "rank",
            existing.rank.is_none(),
            rank.lower.map(|lower| json!(lower)),
        );

        // The payload is always merged, but an unchanged merge result must
        // not count as something to write, or repeated crawls would never
        // reach the skipped steady state.
        let merged = merged_payload(&existing.payload, &candidate.payload, rank);
        if merged != existing.payload {
            patch.insert("payload".into(), Value::Object(merged));
        }

        if patch.is_empty() {
            debug!(entity = %existing.id, name = %candidate.name, "nothing to fill");
            return Ok(ReconcileOutcome::Skipped(Some(existing.id)));
        }

        match self.store.patch(existing.id, patch).await {
            Ok(()) => Ok(ReconcileOutcome::Enriched(existing.id)),
            Err(err) => {
                warn!(
                    error = %err,
                    entity = %existing.id,
                    name = %candidate.name,
                    "patch rejected, skipping candidate"
                );
                Ok(ReconcileOutcome::Skipped(Some(existing.id)))
            }
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

fn string_value(value: Option<&str>) -> Option<Value> {
    non_blank(value).map(|s| json!(s))
}

fn stage_string(fields: &mut Map<String, Value>, column: &str, value: Option<&str>) {
    if let Some(v) = string_value(value) {
        fields.insert(column.to_string(), v);
    }
}

/// Stage one scalar for write. Empty incoming values are never staged;
/// under [`FillPolicy::IfEmpty`] a populated stored value blocks the write.
fn stage_scalar(
    patch: &mut Map<String, Value>,
    policy: FillPolicy,
    column: &str,
    existing_empty: bool,
    incoming: Option<Value>,
) {
    let Some(value) = incoming else {
        return;
    };
    if policy == FillPolicy::IfEmpty && !existing_empty {
        return;
    }
    patch.insert(column.to_string(), value);
}

/// Key-wise union of the stored and incoming payloads, incoming keys
/// winning, plus the rank triple for traceability.
fn merged_payload(
    existing: &Map<String, Value>,
    incoming: &Map<String, Value>,
    rank: &RankValue,
) -> Map<String, Value> {
    let mut merged = existing.clone();
    for (key, value) in incoming {
        merged.insert(key.clone(), value.clone());
    }
    if let Some(display) = &rank.display {
        merged.insert(RANK_DISPLAY_KEY.into(), json!(display));
    }
    if let Some(lower) = rank.lower {
        merged.insert(RANK_LOWER_KEY.into(), json!(lower));
    }
    if let Some(upper) = rank.upper {
        merged.insert(RANK_UPPER_KEY.into(), json!(upper));
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use unirank_core::RankText;
    use unirank_store::MemoryStore;

    fn engine_with_store() -> (ReconcileEngine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (ReconcileEngine::new(store.clone()), store)
    }

    fn candidate(name: &str) -> Candidate {
        Candidate {
            name: name.to_string(),
            ..Candidate::default()
        }
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let (engine, store) = engine_with_store();
        let mut c = candidate("Example University");
        c.website_url = Some("https://example.edu".into());
        c.country = Some("Freedonia".into());
        c.rank = Some(RankText::Text("=5".into()));
        c.payload.insert("region".into(), json!("Europe"));

        let first = engine
            .reconcile(&c, FillPolicy::IfEmpty)
            .await
            .expect("first");
        let id = match first {
            ReconcileOutcome::Inserted(id) => id,
            other => panic!("expected insert, got {other:?}"),
        };

        let after_insert = store.rows().await;

        let second = engine
            .reconcile(&c, FillPolicy::IfEmpty)
            .await
            .expect("second");
        assert_eq!(second, ReconcileOutcome::Skipped(Some(id)));
        assert_eq!(store.rows().await, after_insert, "second run changed the row");
    }

    #[tokio::test]
    async fn populated_fields_are_never_overwritten() {
        let (engine, store) = engine_with_store();
        let mut original = candidate("Example University");
        original.country = Some("Freedonia".into());
        original.rank = Some(RankText::Number(5));
        engine
            .reconcile(&original, FillPolicy::IfEmpty)
            .await
            .expect("insert");

        let mut conflicting = candidate("Example University");
        conflicting.country = Some("Sylvania".into());
        conflicting.location = Some("City X".into());
        conflicting.rank = Some(RankText::Text("10-20".into()));
        let outcome = engine
            .reconcile(&conflicting, FillPolicy::IfEmpty)
            .await
            .expect("enrich");
        assert!(matches!(outcome, ReconcileOutcome::Enriched(_)));

        let row = &store.rows().await[0];
        assert_eq!(row.country.as_deref(), Some("Freedonia"));
        assert_eq!(row.location.as_deref(), Some("City X"));
        assert_eq!(row.rank, Some(5));
    }

    #[tokio::test]
    async fn overwrite_policy_replaces_populated_fields() {
        let (engine, store) = engine_with_store();
        let mut original = candidate("Example University");
        original.country = Some("Freedonia".into());
        original.rank = Some(RankText::Number(5));
        engine
            .reconcile(&original, FillPolicy::IfEmpty)
            .await
            .expect("insert");

        let mut newer = candidate("Example University");
        newer.country = Some("Sylvania".into());
        newer.rank = Some(RankText::Text("10-20".into()));
        let outcome = engine
            .reconcile(&newer, FillPolicy::Overwrite)
            .await
            .expect("overwrite");
        assert!(matches!(outcome, ReconcileOutcome::Enriched(_)));

        let row = &store.rows().await[0];
        assert_eq!(row.country.as_deref(), Some("Sylvania"));
        assert_eq!(row.rank, Some(10));
    }

    #[tokio::test]
    async fn match_falls_back_from_website_to_name() {
        let (engine, _store) = engine_with_store();
        let mut with_site = candidate("Example University");
        with_site.website_url = Some("https://example.edu".into());
        let id = match engine
            .reconcile(&with_site, FillPolicy::IfEmpty)
            .await
            .expect("insert")
        {
            ReconcileOutcome::Inserted(id) => id,
            other => panic!("expected insert, got {other:?}"),
        };

        // No website on the second sighting, but the name still matches.
        let mut by_name = candidate("Example University");
        by_name.location = Some("City X".into());
        let outcome = engine
            .reconcile(&by_name, FillPolicy::IfEmpty)
            .await
            .expect("enrich");
        assert_eq!(outcome, ReconcileOutcome::Enriched(id));
    }

    #[tokio::test]
    async fn payload_union_keeps_both_sides_and_incoming_wins() {
        let (engine, store) = engine_with_store();
        let mut first = candidate("Example University");
        first.payload.insert("k2".into(), json!("stored"));
        first.payload.insert("shared".into(), json!("old"));
        engine
            .reconcile(&first, FillPolicy::IfEmpty)
            .await
            .expect("insert");

        let mut second = candidate("Example University");
        second.payload.insert("k1".into(), json!("incoming"));
        second.payload.insert("shared".into(), json!("new"));
        let outcome = engine
            .reconcile(&second, FillPolicy::IfEmpty)
            .await
            .expect("enrich");
        assert!(matches!(outcome, ReconcileOutcome::Enriched(_)));

        let payload = &store.rows().await[0].payload;
        assert_eq!(payload.get("k1"), Some(&json!("incoming")));
        assert_eq!(payload.get("k2"), Some(&json!("stored")));
        assert_eq!(payload.get("shared"), Some(&json!("new")));
    }

    #[tokio::test]
    async fn rank_triple_lands_in_payload_and_lower_bound_in_scalar() {
        let (engine, store) = engine_with_store();
        let mut c = candidate("Example University");
        c.rank = Some(RankText::Text("201-250".into()));
        engine
            .reconcile(&c, FillPolicy::IfEmpty)
            .await
            .expect("insert");

        let row = &store.rows().await[0];
        assert_eq!(row.rank, Some(201));
        assert_eq!(row.payload.get("rank_display"), Some(&json!("201-250")));
        assert_eq!(row.payload.get("rank_lower"), Some(&json!(201)));
        assert_eq!(row.payload.get("rank_upper"), Some(&json!(250)));
    }

    #[tokio::test]
    async fn unparseable_rank_leaves_scalar_empty() {
        let (engine, store) = engine_with_store();
        let mut c = candidate("Example University");
        c.rank = Some(RankText::Text("Unranked".into()));
        engine
            .reconcile(&c, FillPolicy::IfEmpty)
            .await
            .expect("insert");

        let row = &store.rows().await[0];
        assert_eq!(row.rank, None);
        assert_eq!(row.payload.get("rank_display"), Some(&json!("Unranked")));
        assert_eq!(row.payload.get("rank_lower"), None);
    }

    #[tokio::test]
    async fn open_band_fills_an_empty_rank_on_enrich() {
        let (engine, store) = engine_with_store();
        engine
            .reconcile(&candidate("Example University"), FillPolicy::IfEmpty)
            .await
            .expect("insert");

        let mut ranked = candidate("Example University");
        ranked.rank = Some(RankText::Text("1001+".into()));
        let outcome = engine
            .reconcile(&ranked, FillPolicy::IfEmpty)
            .await
            .expect("enrich");
        assert!(matches!(outcome, ReconcileOutcome::Enriched(_)));

        let row = &store.rows().await[0];
        assert_eq!(row.rank, Some(1001));
        assert_eq!(row.payload.get("rank_upper"), None);
    }

    #[tokio::test]
    async fn blank_strings_count_as_empty_on_both_sides() {
        let (engine, store) = engine_with_store();
        let mut sparse = candidate("Example University");
        sparse.country = Some("   ".into());
        engine
            .reconcile(&sparse, FillPolicy::IfEmpty)
            .await
            .expect("insert");
        assert_eq!(store.rows().await[0].country, None);

        let mut filled = candidate("Example University");
        filled.country = Some("Freedonia".into());
        engine
            .reconcile(&filled, FillPolicy::IfEmpty)
            .await
            .expect("enrich");
        assert_eq!(
            store.rows().await[0].country.as_deref(),
            Some("Freedonia")
        );
    }
}
