use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use fellows_core::{Category, Opportunity, OpportunityDate, PipelineError};
use fellows_extract::{CompletionProvider, CompletionRequest, ProviderChain, ProviderError, ProviderSlot};
use fellows_pipeline::{AssistService, MatchService, SearchError, SearchHit, WebSearcher};
use fellows_storage::{MemoryCatalog, MemoryCounterStore, RateLimitPolicy, RateLimiter};

struct ScriptedProvider {
    reply: Option<String>,
    calls: AtomicUsize,
    last_prompt: std::sync::Mutex<String>,
}

impl ScriptedProvider {
    fn replying(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Some(reply.to_string()),
            calls: AtomicUsize::new(0),
            last_prompt: std::sync::Mutex::new(String::new()),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            reply: None,
            calls: AtomicUsize::new(0),
            last_prompt: std::sync::Mutex::new(String::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_prompt.lock().unwrap() = request
            .messages
            .iter()
            .map(|m| m.content.clone())
            .collect::<Vec<_>>()
            .join("\n");
        self.reply.clone().ok_or(ProviderError::HttpStatus {
            status: 500,
            body: "boom".into(),
        })
    }
}

struct FixedSearcher {
    hits: Vec<SearchHit>,
    calls: AtomicUsize,
}

#[async_trait]
impl WebSearcher for FixedSearcher {
    async fn search(&self, _query: &str, limit: usize) -> Result<Vec<SearchHit>, SearchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(limit, 1);
        Ok(self.hits.clone())
    }
}

fn opportunity(id: &str, organizer: &str) -> Opportunity {
    Opportunity {
        id: id.to_string(),
        name: format!("{id} programme"),
        organizer: organizer.to_string(),
        description: format!("About {id}"),
        full_description: Some(format!("FULL TEXT {id}")),
        open_date: None,
        close_date: None,
        category: Category::Fellowship,
        region: Some("Global".into()),
        country: None,
        eligibility: Some("anyone".into()),
        apply_link: Some(format!("https://apply.example.org/{id}")),
        tags: vec!["ai".into()],
        benefits: vec![],
    }
}

fn catalog_of_five() -> Arc<MemoryCatalog> {
    Arc::new(MemoryCatalog::new(
        ["alpha", "beta", "gamma", "delta", "epsilon"]
            .iter()
            .map(|id| opportunity(id, "Org"))
            .collect(),
    ))
}

fn chain_of(providers: &[Arc<ScriptedProvider>]) -> ProviderChain {
    ProviderChain::new(
        providers
            .iter()
            .enumerate()
            .map(|(i, p)| ProviderSlot::new(p.clone() as Arc<dyn CompletionProvider>, format!("model-{i}")))
            .collect(),
    )
}

fn limiter() -> RateLimiter {
    RateLimiter::new(Arc::new(MemoryCounterStore::new()), RateLimitPolicy::default())
}

const RANKING_REPLY: &str = r#"{"recommendations": [
    {"id": "ghost", "matchScore": 0.99, "reason": "not in catalog"},
    {"id": "alpha", "matchScore": 0.9, "reason": "strong research fit"},
    {"id": "beta", "matchScore": 0.95, "reason": "best fit"},
    {"id": "gamma", "matchScore": 0.2, "reason": "weak fit"},
    {"id": "delta", "matchScore": 0.5, "reason": "partial fit"}
]}"#;

#[tokio::test]
async fn ranking_drops_unknown_ids_and_keeps_top_three_by_score() {
    let provider = ScriptedProvider::replying(RANKING_REPLY);
    let service = MatchService::new(catalog_of_five(), limiter(), chain_of(&[provider.clone()]));

    let ranked = service
        .recommend(Some("user-1"), "I build climate tools")
        .await
        .unwrap();

    let scores = ranked.iter().map(|m| m.match_score).collect::<Vec<_>>();
    assert_eq!(scores, vec![0.95, 0.9, 0.5]);
    assert!(ranked.iter().all(|m| m.opportunity.id != "ghost"));
    assert_eq!(ranked[0].opportunity.id, "beta");
    assert_eq!(ranked[0].reason, "best fit");

    let prompt = provider.last_prompt.lock().unwrap().clone();
    assert!(prompt.contains("I build climate tools"));
    assert!(prompt.contains("\"id\":\"epsilon\""));
    assert!(!prompt.contains("FULL TEXT"));
    assert!(!prompt.contains("apply.example.org"));
}

#[tokio::test]
async fn ranking_requires_identity_and_is_rate_limited() {
    let provider = ScriptedProvider::replying(RANKING_REPLY);
    let service = MatchService::new(catalog_of_five(), limiter(), chain_of(&[provider.clone()]));

    assert_eq!(
        service.recommend(None, "anything").await.unwrap_err(),
        PipelineError::Unauthorized
    );

    for _ in 0..10 {
        service.recommend(Some("user-9"), "anything").await.unwrap();
    }
    let err = service.recommend(Some("user-9"), "anything").await.unwrap_err();
    assert_eq!(err, PipelineError::RateLimited);
    assert_eq!(err.code(), "rate_limited");
    assert_eq!(provider.calls(), 10);
}

#[tokio::test]
async fn non_array_recommendations_exhaust_chain_as_malformed_output() {
    let primary = ScriptedProvider::replying(r#"{"recommendations": "alpha"}"#);
    let secondary = ScriptedProvider::replying(r#"{"recommendations": {"id": "alpha"}}"#);
    let service = MatchService::new(
        catalog_of_five(),
        limiter(),
        chain_of(&[primary.clone(), secondary.clone()]),
    );

    let err = service.recommend(Some("user-1"), "query").await.unwrap_err();
    assert_eq!(err.code(), "malformed_output");
    assert_eq!(primary.calls(), 1);
    assert_eq!(secondary.calls(), 1);
}

#[tokio::test]
async fn primary_outage_without_fallback_surfaces_upstream_failure() {
    let primary = ScriptedProvider::failing();
    let service = MatchService::new(catalog_of_five(), limiter(), chain_of(&[primary.clone()]));

    let err = service.recommend(Some("user-1"), "query").await.unwrap_err();
    assert_eq!(err.code(), "upstream_failure");
    assert_eq!(primary.calls(), 1);
}

#[tokio::test]
async fn assist_with_zero_results_never_calls_the_model() {
    let provider = ScriptedProvider::replying(r#"{"name": "unused"}"#);
    let searcher = Arc::new(FixedSearcher {
        hits: vec![],
        calls: AtomicUsize::new(0),
    });
    let service = AssistService::new(searcher.clone(), chain_of(&[provider.clone()]));

    let err = service.assist("thiel fellowship").await.unwrap_err();
    assert_eq!(err, PipelineError::NoResults);
    assert_eq!(err.code(), "no_results");
    assert_eq!(searcher.calls.load(Ordering::SeqCst), 1);
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn assist_rejects_hits_without_page_text() {
    let provider = ScriptedProvider::replying(r#"{"name": "unused"}"#);
    let searcher = Arc::new(FixedSearcher {
        hits: vec![SearchHit {
            url: "https://thielfellowship.org".into(),
            title: Some("Thiel Fellowship".into()),
            markdown: Some("   ".into()),
        }],
        calls: AtomicUsize::new(0),
    });
    let service = AssistService::new(searcher, chain_of(&[provider.clone()]));

    assert_eq!(service.assist("thiel").await.unwrap_err(), PipelineError::NoContent);
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn assist_returns_unmodified_draft_for_review() {
    let provider = ScriptedProvider::replying(
        r#"{"name": "Thiel Fellowship", "organizer": "Thiel Foundation", "category": "fellowship",
            "closeDate": "closed", "benefits": ["$200,000 grant"], "logoUrl": "https://x/logo.png"}"#,
    );
    let searcher = Arc::new(FixedSearcher {
        hits: vec![SearchHit {
            url: "https://thielfellowship.org".into(),
            title: None,
            markdown: Some("# Thiel Fellowship\nTwo years, $200,000.".into()),
        }],
        calls: AtomicUsize::new(0),
    });
    let service = AssistService::new(searcher, chain_of(&[provider.clone()]));

    let assisted = service.assist("thiel fellowship").await.unwrap();
    assert_eq!(assisted.source_url, "https://thielfellowship.org");
    assert_eq!(assisted.suggested_id.as_deref(), Some("thiel-fellowship"));
    assert_eq!(assisted.draft.organizer.as_deref(), Some("Thiel Foundation"));
    assert_eq!(assisted.draft.benefits, vec!["$200,000 grant".to_string()]);
    assert_eq!(assisted.draft.close_date, Some(OpportunityDate::Closed));

    let prompt = provider.last_prompt.lock().unwrap().clone();
    assert!(prompt.contains("Source URL: https://thielfellowship.org"));
    assert!(prompt.contains("Two years, $200,000."));
}
