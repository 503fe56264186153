use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use proptest::prelude::*;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedReceiver;

use super::*;
use crate::backend::{
    Backends, LexicalSearch, OverlapReranker, QueryEmbedder, RerankPolicy, Reranker,
    SharedCorpus, StageTimeouts, StoreCorpus,
};
use crate::search::{HashEmbedder, Provenance};
use crate::storage::LexicalHit;
use crate::test_utils::fixtures::seeded_store;
use crate::test_utils::logging::init_test_tracing;

const DIMS: usize = 128;
const SETTLE: Duration = Duration::from_secs(5);

struct Harness {
    orch: Orchestrator,
    rx: UnboundedReceiver<PipelineEvent>,
    store: Arc<Store>,
}

impl Harness {
    fn visible_ids(&self) -> Vec<ItemId> {
        self.orch.visible().iter().map(|row| row.item.id).collect()
    }

    fn item_by_title(&self, title: &str) -> ItemRecord {
        self.store
            .read(|db| db.list_items(100, 0))
            .unwrap()
            .into_iter()
            .find(|item| item.title == title)
            .unwrap()
    }

    fn front_page(&self) -> ListSnapshot {
        ListSnapshot {
            items: self.store.read(|db| db.list_items(100, 0)).unwrap(),
            selected: 0,
        }
    }

    async fn settle(&mut self) {
        self.orch.drive_until_idle(&mut self.rx, SETTLE).await.unwrap();
    }
}

struct HarnessBuilder {
    embedder: Arc<dyn QueryEmbedder>,
    reranker: Option<Arc<dyn Reranker>>,
    lexical: Option<Arc<dyn LexicalSearch>>,
    config: Config,
}

impl HarnessBuilder {
    fn new() -> Self {
        let mut config = Config::default();
        config.search.min_cosine = 0.0;
        Self {
            embedder: Arc::new(HashEmbedder::new(DIMS)),
            reranker: None,
            lexical: None,
            config,
        }
    }

    fn embedder(mut self, embedder: impl QueryEmbedder + 'static) -> Self {
        self.embedder = Arc::new(embedder);
        self
    }

    fn reranker(mut self, reranker: impl Reranker + 'static) -> Self {
        self.reranker = Some(Arc::new(reranker));
        self
    }

    fn lexical(mut self, lexical: impl LexicalSearch + 'static) -> Self {
        self.lexical = Some(Arc::new(lexical));
        self
    }

    fn max_unpinned(mut self, max: u32) -> Self {
        self.config.history.max_unpinned = max;
        self
    }

    fn build_on(self, runtime: Handle) -> Harness {
        init_test_tracing();
        let store = Arc::new(seeded_store(DIMS));
        let backends = Backends {
            embedder: self.embedder,
            corpus: Arc::new(StoreCorpus::new(Arc::clone(&store))),
            reranker: self.reranker,
            lexical: self.lexical.unwrap_or_else(|| Arc::clone(&store) as Arc<dyn LexicalSearch>),
            timeouts: StageTimeouts {
                embed: Duration::from_secs(2),
                corpus: Duration::from_secs(2),
                rerank: Duration::from_secs(2),
            },
        };
        let (orch, rx) = Orchestrator::new(
            Arc::clone(&store),
            backends,
            Arc::new(SharedCorpus::new()),
            &self.config,
            runtime,
        );
        Harness { orch, rx, store }
    }

    fn build(self) -> Harness {
        self.build_on(Handle::current())
    }
}

struct FailingEmbedder;

#[async_trait]
impl QueryEmbedder for FailingEmbedder {
    fn name(&self) -> &str {
        "failing"
    }

    async fn embed_query(&self, _text: &str) -> Result<Vec<f32>> {
        Err(FerretError::backend("failing", "connection refused"))
    }
}

/// Lexical adapter that never matches, so cached placeholders stay visible.
struct NoLexical;

impl LexicalSearch for NoLexical {
    fn search_lexical(&self, _text: &str, _limit: usize) -> Result<Vec<LexicalHit>> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn climate_risk_shows_lexical_then_semantic() {
    let mut h = HarnessBuilder::new().build();
    let page = h.front_page();

    h.orch.submit("climate risk", &page).unwrap();

    let session = h.orch.session().unwrap();
    assert_eq!(session.stages().lexical, StageStatus::Ready);
    assert_eq!(session.stages().embedding, StageStatus::Pending);
    assert_eq!(session.stages().corpus, StageStatus::Pending);
    let lexical_ids = h.visible_ids();
    assert!(!lexical_ids.is_empty());
    for row in h.orch.visible() {
        assert_eq!(row.score.unwrap().provenance(), Provenance::LEXICAL);
        assert!(!row.cached);
    }

    h.settle().await;

    let session = h.orch.session().unwrap();
    assert_eq!(session.stages().embedding, StageStatus::Ready);
    assert_eq!(session.stages().corpus, StageStatus::Ready);
    assert_eq!(session.stages().rerank, StageStatus::Skipped);
    for id in &lexical_ids {
        let record = session.record(*id).unwrap();
        assert_eq!(record.provenance(), Provenance::LEXICAL | Provenance::COSINE);
    }
    assert!(h.visible_ids().len() >= lexical_ids.len());

    let entry = h
        .store
        .read(|db| db.get_history_by_query("climate risk"))
        .unwrap()
        .unwrap();
    assert_eq!(entry.use_count, 1);
    assert_eq!(entry.result_count as usize, h.visible_ids().len());
    assert!(entry.query_embedding.is_some());
}

#[tokio::test]
async fn stale_events_are_ignored() {
    let mut h = HarnessBuilder::new().build();
    let page = h.front_page();

    let first = h.orch.submit("climate risk", &page).unwrap();
    let second = h.orch.submit("battery storage", &page).unwrap();
    assert!(second > first);
    let before = h.visible_ids();

    let applied = h.orch.apply(PipelineEvent::RerankFinished {
        token: first,
        result: Ok(before.iter().map(|id| (*id, 9.0)).collect()),
    });
    assert!(!applied);
    assert_eq!(h.visible_ids(), before);

    h.settle().await;
    let session = h.orch.session().unwrap();
    assert_eq!(session.token(), second);
    assert_eq!(session.query_text(), "battery storage");
    assert!(session.records().values().all(|r| r.rerank().is_none()));

    let stale_embedding = h.orch.apply(PipelineEvent::QueryEmbedded {
        token: first,
        result: Err(FerretError::Timeout("embed".to_string())),
    });
    assert!(!stale_embedding);
    assert_eq!(h.orch.session().unwrap().stages().embedding, StageStatus::Ready);
}

#[tokio::test]
async fn pre_search_list_is_snapshotted_once() {
    let mut h = HarnessBuilder::new().build();
    let page = h.front_page();
    let seed = h.item_by_title("Grid battery storage expands");

    h.orch.submit("climate risk", &page).unwrap();
    h.settle().await;

    let results_page = ListSnapshot {
        items: h.orch.visible().iter().map(|row| row.item.clone()).collect(),
        selected: 1,
    };
    h.orch.submit("heat pumps", &results_page).unwrap();
    h.orch.pivot(&seed, &results_page);
    h.settle().await;

    assert!(!h.orch.snapshot_list(&results_page));
    assert_eq!(h.orch.leave_results(), Some(page));
    assert!(h.orch.session().is_none());
    assert_eq!(h.orch.leave_results(), None);
}

#[tokio::test]
async fn equivalent_queries_share_one_history_entry() {
    let mut h = HarnessBuilder::new().build();
    let page = h.front_page();

    h.orch.submit("Climate Risk", &page).unwrap();
    h.settle().await;
    h.orch.leave_results();

    h.orch.submit("  climate   RISK ", &page).unwrap();
    h.settle().await;

    let history = h.store.read(|db| db.list_history(10)).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].normalized_query, "climate risk");
    assert_eq!(history[0].use_count, 2);
    assert_eq!(history[0].raw_query, "climate   RISK");
}

async fn run_sequential_rerank(h: &mut Harness, interrupt: bool) -> Vec<(ItemId, Option<f32>)> {
    let page = h.front_page();
    h.orch.submit("climate risk", &page).unwrap();
    h.settle().await;
    assert!(h.orch.rerank_available());

    let before = h.visible_ids();
    assert!(h.orch.start_rerank());
    assert_eq!(h.orch.session().unwrap().stages().rerank, StageStatus::Pending);

    if interrupt {
        tokio::time::sleep(Duration::from_millis(60)).await;
        h.orch.drain(&mut h.rx);
        let progress = h.orch.session().unwrap().rerank_progress().unwrap();
        assert!(progress.done >= 1);
        assert_eq!(h.visible_ids(), before);

        assert!(h.orch.cancel());
        let session = h.orch.session().unwrap();
        assert_eq!(session.stages().rerank, StageStatus::Available);
        assert!(session.rerank_progress().is_none());
        assert_eq!(h.visible_ids(), before);
        assert!(h.orch.status().starts_with("cancelled"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(h.orch.drain(&mut h.rx), 0);
        assert_eq!(h.visible_ids(), before);

        assert!(h.orch.start_rerank());
    }

    h.settle().await;
    let session = h.orch.session().unwrap();
    assert_eq!(session.stages().rerank, StageStatus::Ready);
    h.visible_ids()
        .into_iter()
        .map(|id| (id, session.record(id).and_then(ScoreRecord::rerank)))
        .collect()
}

#[tokio::test]
async fn cancelled_rerank_reapplies_like_an_uninterrupted_run() {
    let sequential = || {
        OverlapReranker::new(RerankPolicy::Sequential).with_delay(Duration::from_millis(15))
    };

    let mut interrupted = HarnessBuilder::new().reranker(sequential()).build();
    let mut straight = HarnessBuilder::new().reranker(sequential()).build();

    let a = run_sequential_rerank(&mut interrupted, true).await;
    let b = run_sequential_rerank(&mut straight, false).await;
    assert_eq!(a, b);
    assert!(a.first().and_then(|(_, score)| *score).is_some());

    let entry = interrupted
        .store
        .read(|db| db.get_history_by_query("climate risk"))
        .unwrap()
        .unwrap();
    assert_eq!(entry.use_count, 1);
    let rows = interrupted
        .store
        .read(|db| db.history_results(entry.id))
        .unwrap();
    assert!(rows.iter().any(|row| row.rerank_score.is_some()));
}

#[tokio::test]
async fn partial_rerank_scores_can_be_applied() {
    let mut h = HarnessBuilder::new()
        .reranker(OverlapReranker::new(RerankPolicy::Sequential).with_delay(Duration::from_millis(20)))
        .build();
    let page = h.front_page();
    h.orch.submit("climate risk", &page).unwrap();
    h.settle().await;

    assert!(h.orch.start_rerank());
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.orch.drain(&mut h.rx);
    assert!(h.orch.start_rerank());

    let session = h.orch.session().unwrap();
    let reranked = session
        .records()
        .values()
        .filter(|r| r.provenance().contains(Provenance::RERANKED))
        .count();
    assert!(reranked >= 1);
    let first = h.orch.visible()[0].score.unwrap().provenance();
    assert!(first.contains(Provenance::RERANKED));

    h.settle().await;
    assert_eq!(h.orch.session().unwrap().stages().rerank, StageStatus::Ready);
}

#[tokio::test]
async fn pivot_excludes_seed_and_skips_history() {
    let mut h = HarnessBuilder::new().build();
    let page = h.front_page();
    let seed = h.item_by_title("Climate risk assessment gains traction");

    h.orch.pivot(&seed, &page);

    let session = h.orch.session().unwrap();
    assert_eq!(session.query_text(), "");
    assert_eq!(session.seed(), Some(seed.id));
    assert_eq!(session.stages().lexical, StageStatus::Skipped);
    assert_eq!(session.stages().embedding, StageStatus::Ready);

    h.settle().await;
    let ids = h.visible_ids();
    assert!(!ids.is_empty());
    assert!(!ids.contains(&seed.id));
    for row in h.orch.visible() {
        assert_eq!(row.score.unwrap().provenance(), Provenance::COSINE);
    }
    assert_eq!(h.store.read(|db| db.count_history()).unwrap(), 0);
}

#[tokio::test]
async fn pivot_without_stored_embedding_embeds_seed_text() {
    let mut h = HarnessBuilder::new().build();
    let id = h
        .store
        .write(|db| {
            db.upsert_item(&crate::test_utils::fixtures::new_item(
                "fresh",
                "Solar farms climate risk",
                "2026-03-09T09:00:00Z",
            ))
        })
        .unwrap();
    let seed = h.store.read(|db| db.get_item(id)).unwrap().unwrap();
    assert!(!seed.has_embedding);

    h.orch.pivot(&seed, &ListSnapshot::default());
    assert_eq!(h.orch.session().unwrap().stages().embedding, StageStatus::Pending);

    h.settle().await;
    assert_eq!(h.orch.session().unwrap().stages().embedding, StageStatus::Ready);
    assert!(!h.visible_ids().contains(&id));
}

#[tokio::test]
async fn failed_embedding_keeps_lexical_results() {
    let mut h = HarnessBuilder::new().embedder(FailingEmbedder).build();
    let page = h.front_page();

    h.orch.submit("climate risk", &page).unwrap();
    let lexical = h.visible_ids();
    h.settle().await;

    let session = h.orch.session().unwrap();
    assert_eq!(session.stages().embedding, StageStatus::Failed);
    assert_eq!(session.stages().corpus, StageStatus::Ready);
    assert_eq!(session.stages().rerank, StageStatus::Idle);
    assert_eq!(h.visible_ids(), lexical);
    assert!(h.orch.status().contains("semantic ranking unavailable"));
    assert!(h.orch.diagnostics().any(|line| line.contains("embedding failed")));
}

#[tokio::test]
async fn batch_rerank_applies_automatically() {
    let mut h = HarnessBuilder::new()
        .reranker(OverlapReranker::new(RerankPolicy::Batch))
        .build();
    let page = h.front_page();

    h.orch.submit("climate risk", &page).unwrap();
    h.settle().await;

    let session = h.orch.session().unwrap();
    assert_eq!(session.stages().rerank, StageStatus::Ready);
    let top = h.orch.visible()[0];
    assert_eq!(top.item.title, "Climate risk assessment gains traction");
    assert!(top.score.unwrap().provenance().contains(Provenance::RERANKED));
    assert!(!h.orch.start_rerank());
}

#[tokio::test]
async fn exact_cache_hit_shows_placeholder_until_live_results() {
    let mut h = HarnessBuilder::new().lexical(NoLexical).build();
    let page = h.front_page();

    h.orch.submit("climate risk", &page).unwrap();
    h.settle().await;
    let first = h.visible_ids();
    assert!(!first.is_empty());
    h.orch.leave_results();

    h.orch.submit("Climate  Risk", &page).unwrap();
    let rows = h.orch.visible();
    assert!(rows.iter().all(|row| row.cached));
    assert_eq!(rows.iter().map(|row| row.item.id).collect::<Vec<_>>(), first);
    assert!(h.orch.status().starts_with("cached results"));

    h.settle().await;
    let rows = h.orch.visible();
    assert!(!rows.is_empty());
    assert!(rows.iter().all(|row| !row.cached));
}

#[tokio::test]
async fn pinned_entries_survive_retention() {
    let mut h = HarnessBuilder::new().max_unpinned(2).build();
    let page = h.front_page();

    h.orch.submit("climate risk", &page).unwrap();
    h.settle().await;
    let pinned = h
        .store
        .read(|db| db.get_history_by_query("climate risk"))
        .unwrap()
        .unwrap();
    assert!(h.store.write(|db| db.set_pinned(pinned.id, true)).unwrap());

    for query in ["battery storage", "offshore wind", "chip exports", "heat pumps"] {
        h.orch.submit(query, &page).unwrap();
        h.settle().await;
    }

    let history = h.store.read(|db| db.list_history(10)).unwrap();
    assert_eq!(history.len(), 3);
    assert!(history[0].pinned);
    assert_eq!(history[0].normalized_query, "climate risk");
    let unpinned: Vec<&str> = history[1..]
        .iter()
        .map(|entry| entry.normalized_query.as_str())
        .collect();
    assert_eq!(unpinned, vec!["heat pumps", "chip exports"]);
}

#[tokio::test]
async fn empty_query_is_rejected() {
    let mut h = HarnessBuilder::new().build();
    let err = h.orch.submit("   ", &ListSnapshot::default()).unwrap_err();
    assert!(matches!(err, FerretError::QueryParse(_)));
    assert!(h.orch.session().is_none());
}

#[tokio::test]
async fn cancel_with_nothing_in_flight_is_noop() {
    let mut h = HarnessBuilder::new().build();
    assert!(!h.orch.cancel());
    let page = h.front_page();
    h.orch.submit("heat pumps", &page).unwrap();
    h.settle().await;
    let token = h.orch.session().unwrap().token();
    assert!(!h.orch.cancel());
    assert_eq!(h.orch.session().unwrap().token(), token);
}

#[tokio::test]
async fn items_changed_drops_shared_corpus() {
    let mut h = HarnessBuilder::new().build();
    let page = h.front_page();
    h.orch.submit("heat pumps", &page).unwrap();
    h.settle().await;
    assert!(h.orch.corpus.get().1.is_some());

    h.orch.items_changed();
    assert!(h.orch.corpus.get().1.is_none());
}

#[derive(Debug, Clone)]
enum Op {
    Submit(usize),
    Pivot(usize),
    Cancel,
    Leave,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..4).prop_map(Op::Submit),
        (0usize..8).prop_map(Op::Pivot),
        Just(Op::Cancel),
        Just(Op::Leave),
    ]
}

const QUERIES: [&str; 4] = ["climate risk", "battery", "wind auctions", "rates"];

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn tokens_increase_and_old_tokens_stay_stale(ops in prop::collection::vec(op_strategy(), 1..24)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = runtime.enter();
        let mut h = HarnessBuilder::new().build_on(runtime.handle().clone());
        let page = h.front_page();

        let mut seen: Vec<SessionToken> = Vec::new();
        for op in ops {
            match op {
                Op::Submit(idx) => {
                    h.orch.submit(QUERIES[idx], &page).unwrap();
                }
                Op::Pivot(idx) => {
                    let seed = page.items[idx].clone();
                    h.orch.pivot(&seed, &page);
                }
                Op::Cancel => {
                    h.orch.cancel();
                }
                Op::Leave => {
                    h.orch.leave_results();
                }
            }

            if let Some(session) = h.orch.session() {
                let token = session.token();
                if seen.last() != Some(&token) {
                    if let Some(last) = seen.last() {
                        prop_assert!(token > *last);
                    }
                    seen.push(token);
                }
            }

            let current = h.orch.session().map(SearchSession::token);
            for old in seen.iter().copied().filter(|t| Some(*t) != current) {
                let applied = h.orch.apply(PipelineEvent::CorpusLoaded {
                    token: old,
                    result: Err(FerretError::Cancelled("corpus".to_string())),
                });
                prop_assert!(!applied);
            }
        }
    }
}

#[derive(Debug, Clone)]
enum Step {
    Embedded,
    Corpus,
    Progress(usize),
    Finished(usize),
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        Just(Step::Embedded),
        Just(Step::Corpus),
        (0usize..8).prop_map(Step::Progress),
        (1usize..8).prop_map(Step::Finished),
    ]
}

/// Every stage completes at least once, in any order, with repeats mixed in.
fn step_sequence() -> impl Strategy<Value = Vec<Step>> {
    (
        Just(vec![Step::Embedded, Step::Corpus, Step::Progress(0), Step::Finished(3)]),
        prop::collection::vec(step_strategy(), 0..8),
    )
        .prop_flat_map(|(mut steps, extra)| {
            steps.extend(extra);
            Just(steps).prop_shuffle()
        })
}

fn provenance_by_item(orch: &Orchestrator) -> HashMap<ItemId, Provenance> {
    orch.session()
        .map(|session| {
            session
                .records()
                .iter()
                .map(|(id, record)| (*id, record.provenance()))
                .collect()
        })
        .unwrap_or_default()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn provenance_only_grows_within_a_session(steps in step_sequence()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = runtime.enter();
        let mut h = HarnessBuilder::new().build_on(runtime.handle().clone());
        let page = h.front_page();

        let stale = h.orch.submit("battery", &page).unwrap();
        let token = h.orch.submit("climate risk", &page).unwrap();
        prop_assert!(stale < token);

        let query = HashEmbedder::new(DIMS).embed("climate risk");
        let corpus = Arc::new(Corpus::new(h.store.read(|db| db.load_corpus()).unwrap()));

        for step in steps {
            let session = h.orch.session().unwrap();
            let stages = *session.stages();
            let progress = session.rerank_progress();
            let applied = h.orch.apply(PipelineEvent::RerankProgress {
                token: stale,
                item_id: page.items[0].id,
                score: 9.0,
                done: 1,
                total: 1,
            });
            prop_assert!(!applied);
            let session = h.orch.session().unwrap();
            prop_assert_eq!(*session.stages(), stages);
            prop_assert_eq!(session.rerank_progress(), progress);

            let before = provenance_by_item(&h.orch);
            let event = match step {
                Step::Embedded => PipelineEvent::QueryEmbedded {
                    token,
                    result: Ok(query.clone()),
                },
                Step::Corpus => PipelineEvent::CorpusLoaded {
                    token,
                    result: Ok(Arc::clone(&corpus)),
                },
                Step::Progress(idx) => PipelineEvent::RerankProgress {
                    token,
                    item_id: page.items[idx].id,
                    score: 0.5,
                    done: idx + 1,
                    total: page.items.len(),
                },
                Step::Finished(count) => PipelineEvent::RerankFinished {
                    token,
                    result: Ok(page
                        .items
                        .iter()
                        .take(count)
                        .map(|item| (item.id, 0.9))
                        .collect()),
                },
            };
            prop_assert!(h.orch.apply(event));

            let after = provenance_by_item(&h.orch);
            for (id, earlier) in &before {
                let later = after.get(id).copied().unwrap_or_default();
                prop_assert!(
                    earlier.is_subset_of(later),
                    "item {} lost provenance: {:?} -> {:?}",
                    id,
                    earlier,
                    later
                );
            }
        }
    }
}
