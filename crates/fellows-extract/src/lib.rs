//! Generative extraction: schema-driven prompts, an ordered provider fallback chain,
//! and validation/repair of untrusted model output.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use fellows_core::{Category, ExtractionDraft, OpportunityDate, PipelineError};
use serde::Serialize;
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "fellows-extract";

/// Category assigned when the model returns something outside the enumeration.
pub const DEFAULT_CATEGORY: Category = Category::Fellowship;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

pub fn build_http_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build().context("building reqwest client")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub temperature: f64,
    pub json_object: bool,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("completion carried no message content")]
    EmptyCompletion,
}

/// A generative backend. Backends are interchangeable; ordering lives in [`ProviderChain`].
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct OpenAiCompatProvider {
    name: String,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiCompatProvider {
    pub fn new(
        name: impl Into<String>,
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

fn chat_body(request: &CompletionRequest) -> JsonValue {
    let mut body = json!({
        "model": request.model,
        "messages": request.messages,
        "temperature": request.temperature,
    });
    if request.json_object {
        body["response_format"] = json!({ "type": "json_object" });
    }
    body
}

#[async_trait]
impl CompletionProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError> {
        let body = chat_body(request);

        debug!(provider = %self.name, model = %request.model, "requesting completion");
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::HttpStatus {
                status: status.as_u16(),
                body: truncate_to_char_boundary(&body, 500).to_string(),
            });
        }

        let parsed: JsonValue = response.json().await?;
        parsed["choices"][0]["message"]["content"]
            .as_str()
            .filter(|content| !content.trim().is_empty())
            .map(ToString::to_string)
            .ok_or(ProviderError::EmptyCompletion)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionError {
    #[error("no generative provider is configured")]
    NoProviders,
    #[error("provider `{provider}` failed: {message}")]
    Upstream { provider: String, message: String },
    #[error("provider `{provider}` returned malformed output: {message}")]
    MalformedOutput { provider: String, message: String },
}

impl From<ExtractionError> for PipelineError {
    fn from(err: ExtractionError) -> Self {
        match err {
            ExtractionError::MalformedOutput { .. } => PipelineError::MalformedOutput(err.to_string()),
            other => PipelineError::UpstreamFailure(other.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct ProviderSlot {
    pub provider: Arc<dyn CompletionProvider>,
    pub model: String,
}

impl ProviderSlot {
    pub fn new(provider: Arc<dyn CompletionProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }
}

/// Ordered fallback chain. Each slot gets exactly one attempt with the same prompt;
/// the first output that parses and passes the caller's shape check wins.
#[derive(Clone)]
pub struct ProviderChain {
    slots: Vec<ProviderSlot>,
    temperature: f64,
    attempt_timeout: Duration,
}

impl ProviderChain {
    pub fn new(slots: Vec<ProviderSlot>) -> Self {
        Self {
            slots,
            temperature: 0.1,
            attempt_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[ProviderSlot] {
        &self.slots
    }

    /// Run `messages` down the chain, returning the first output accepted by `check`.
    pub async fn extract_json<T, F>(
        &self,
        messages: Vec<ChatMessage>,
        check: F,
    ) -> Result<T, ExtractionError>
    where
        F: Fn(JsonValue) -> Result<T, String>,
    {
        let mut last_error = ExtractionError::NoProviders;

        for (attempt, slot) in self.slots.iter().enumerate() {
            let provider = slot.provider.name().to_string();
            if attempt > 0 {
                warn!(provider = %provider, error = %last_error, "falling back to next provider");
            }

            let request = CompletionRequest {
                messages: messages.clone(),
                model: slot.model.clone(),
                temperature: self.temperature,
                json_object: true,
            };
            let completion = match tokio::time::timeout(
                self.attempt_timeout,
                slot.provider.complete(&request),
            )
            .await
            {
                Ok(Ok(text)) => text,
                Ok(Err(ProviderError::EmptyCompletion)) => {
                    last_error = ExtractionError::MalformedOutput {
                        provider,
                        message: ProviderError::EmptyCompletion.to_string(),
                    };
                    continue;
                }
                Ok(Err(err)) => {
                    last_error = ExtractionError::Upstream {
                        provider,
                        message: err.to_string(),
                    };
                    continue;
                }
                Err(_) => {
                    last_error = ExtractionError::Upstream {
                        provider,
                        message: ProviderError::Timeout(self.attempt_timeout).to_string(),
                    };
                    continue;
                }
            };

            match parse_json_object(&completion).and_then(|object| check(JsonValue::Object(object))) {
                Ok(value) => return Ok(value),
                Err(message) => {
                    last_error = ExtractionError::MalformedOutput { provider, message };
                }
            }
        }

        Err(last_error)
    }

    pub async fn extract(
        &self,
        source_text: &str,
        instructions: &SchemaSpec,
    ) -> Result<ExtractionDraft, ExtractionError> {
        let messages = vec![
            ChatMessage::system(instructions.render()),
            ChatMessage::user(source_text),
        ];
        self.extract_json(messages, draft_from_untrusted).await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Text,
    Number,
    Date,
    TextList,
    Enum {
        values: Vec<&'static str>,
        default: &'static str,
    },
    ObjectList(Vec<FieldSpec>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub description: &'static str,
}

impl FieldSpec {
    pub fn new(name: &'static str, kind: FieldKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            description,
        }
    }

    fn render_type(&self) -> String {
        match &self.kind {
            FieldKind::Text => "string or null".to_string(),
            FieldKind::Number => "number".to_string(),
            FieldKind::Date => {
                "string \"YYYY-MM-DD\", the string \"closed\", or null when unknown".to_string()
            }
            FieldKind::TextList => "array of strings".to_string(),
            FieldKind::Enum { values, default } => format!(
                "exactly one of: {}; use \"{default}\" when the source is ambiguous",
                values.join(", ")
            ),
            FieldKind::ObjectList(fields) => format!(
                "array of objects, each with {}",
                fields
                    .iter()
                    .map(|f| format!("\"{}\" ({}): {}", f.name, f.render_type(), f.description))
                    .collect::<Vec<_>>()
                    .join("; ")
            ),
        }
    }
}

/// Instruction contract handed to every provider in the chain.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaSpec {
    pub purpose: String,
    pub fields: Vec<FieldSpec>,
}

impl SchemaSpec {
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.purpose);
        out.push_str("\n\nRespond with a single JSON object and nothing else. Required fields:\n");
        for field in &self.fields {
            out.push_str(&format!(
                "- \"{}\" ({}): {}\n",
                field.name,
                field.render_type(),
                field.description
            ));
        }
        out.push_str("\nOnly use facts present in the provided input. Do not add other fields.");
        out
    }

    /// Full opportunity schema, minus `id` and image/asset fields.
    pub fn opportunity_draft() -> Self {
        let categories = Category::ALL.iter().map(Category::as_str).collect::<Vec<_>>();
        Self {
            purpose: "You extract structured records for a catalog of fellowships, grants, \
                      accelerators and similar opportunities from scraped web content."
                .to_string(),
            fields: vec![
                FieldSpec::new("name", FieldKind::Text, "official programme name"),
                FieldSpec::new("organizer", FieldKind::Text, "organization running the programme"),
                FieldSpec::new("description", FieldKind::Text, "one or two sentence summary"),
                FieldSpec::new("fullDescription", FieldKind::Text, "detailed description in markdown"),
                FieldSpec::new("openDate", FieldKind::Date, "date applications open"),
                FieldSpec::new("closeDate", FieldKind::Date, "application deadline"),
                FieldSpec::new(
                    "category",
                    FieldKind::Enum {
                        values: categories,
                        default: DEFAULT_CATEGORY.as_str(),
                    },
                    "kind of opportunity",
                ),
                FieldSpec::new("region", FieldKind::Text, "world region served, e.g. Global, Europe"),
                FieldSpec::new("country", FieldKind::Text, "country, or Global"),
                FieldSpec::new("eligibility", FieldKind::Text, "who may apply"),
                FieldSpec::new("applyLink", FieldKind::Text, "URL of the application page"),
                FieldSpec::new("tags", FieldKind::TextList, "short topical keywords"),
                FieldSpec::new("benefits", FieldKind::TextList, "funding, mentorship and other perks"),
            ],
        }
    }

    /// Ranking schema: scored candidate ids drawn from a supplied catalog digest.
    pub fn match_recommendations() -> Self {
        Self {
            purpose: "You match a person's description of themselves and their goals against a \
                      catalog of opportunities. Only recommend ids that appear in the catalog."
                .to_string(),
            fields: vec![FieldSpec::new(
                "recommendations",
                FieldKind::ObjectList(vec![
                    FieldSpec::new("id", FieldKind::Text, "catalog id of the opportunity"),
                    FieldSpec::new("matchScore", FieldKind::Number, "fit between 0 and 1"),
                    FieldSpec::new("reason", FieldKind::Text, "one sentence on why it fits"),
                ]),
                "best matches, most relevant first",
            )],
        }
    }
}

pub fn truncate_to_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn strip_code_fences(text: &str) -> &str {
    text.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// Parse a completion as a single JSON object.
pub fn parse_json_object(text: &str) -> Result<Map<String, JsonValue>, String> {
    match serde_json::from_str::<JsonValue>(strip_code_fences(text)) {
        Ok(JsonValue::Object(object)) => Ok(object),
        Ok(other) => Err(format!("expected a JSON object, got {}", json_kind(&other))),
        Err(err) => Err(format!("invalid JSON: {err}")),
    }
}

pub fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn text_field(object: &Map<String, JsonValue>, key: &str) -> Option<String> {
    object
        .get(key)
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

fn date_field(object: &Map<String, JsonValue>, key: &str) -> Option<OpportunityDate> {
    object
        .get(key)
        .and_then(JsonValue::as_str)
        .and_then(OpportunityDate::parse)
}

fn list_field(object: &Map<String, JsonValue>, key: &str) -> Vec<String> {
    object
        .get(key)
        .and_then(JsonValue::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(JsonValue::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub fn coerce_category(raw: Option<&JsonValue>) -> Category {
    raw.and_then(JsonValue::as_str)
        .map(|s| s.trim().to_ascii_lowercase().replace([' ', '-'], "_"))
        .and_then(|s| Category::from_str(&s).ok())
        .unwrap_or(DEFAULT_CATEGORY)
}

/// Type-check every field of an untrusted draft; wrong-typed values become unknown.
pub fn draft_from_untrusted(value: JsonValue) -> Result<ExtractionDraft, String> {
    let JsonValue::Object(object) = value else {
        return Err(format!("expected a JSON object, got {}", json_kind(&value)));
    };

    Ok(ExtractionDraft {
        name: text_field(&object, "name"),
        organizer: text_field(&object, "organizer"),
        description: text_field(&object, "description"),
        full_description: text_field(&object, "fullDescription"),
        open_date: date_field(&object, "openDate"),
        close_date: date_field(&object, "closeDate"),
        category: coerce_category(object.get("category")),
        region: text_field(&object, "region"),
        country: text_field(&object, "country"),
        eligibility: text_field(&object, "eligibility"),
        apply_link: text_field(&object, "applyLink"),
        tags: list_field(&object, "tags"),
        benefits: list_field(&object, "benefits"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Script {
        Reply(&'static str),
        Fail,
        Hang,
    }

    struct StubProvider {
        name: &'static str,
        script: Script,
        calls: AtomicUsize,
        seen_models: std::sync::Mutex<Vec<String>>,
    }

    impl StubProvider {
        fn new(name: &'static str, script: Script) -> Arc<Self> {
            Arc::new(Self {
                name,
                script,
                calls: AtomicUsize::new(0),
                seen_models: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CompletionProvider for StubProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_models.lock().unwrap().push(request.model.clone());
            assert!(request.json_object);
            match self.script {
                Script::Reply(text) => Ok(text.to_string()),
                Script::Fail => Err(ProviderError::HttpStatus {
                    status: 503,
                    body: "overloaded".into(),
                }),
                Script::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok("{}".into())
                }
            }
        }
    }

    fn chain(slots: Vec<(Arc<StubProvider>, &str)>) -> ProviderChain {
        ProviderChain::new(
            slots
                .into_iter()
                .map(|(p, model)| ProviderSlot::new(p as Arc<dyn CompletionProvider>, model))
                .collect(),
        )
    }

    #[tokio::test]
    async fn primary_failure_without_secondary_surfaces_upstream_failure() {
        let primary = StubProvider::new("primary", Script::Fail);
        let chain = chain(vec![(primary.clone(), "gpt-4o-mini")]);

        let err = chain
            .extract("Some page", &SchemaSpec::opportunity_draft())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::Upstream { ref provider, .. } if provider == "primary"));
        assert_eq!(PipelineError::from(err).code(), "upstream_failure");
        assert_eq!(primary.calls(), 1);
    }

    #[tokio::test]
    async fn secondary_receives_same_prompt_with_its_own_model() {
        let primary = StubProvider::new("primary", Script::Fail);
        let secondary = StubProvider::new("secondary", Script::Reply(r#"{"name":"Fellowship X","category":"grant"}"#));
        let chain = chain(vec![(primary.clone(), "model-a"), (secondary.clone(), "model-b")]);

        let draft = chain
            .extract("page text", &SchemaSpec::opportunity_draft())
            .await
            .unwrap();
        assert_eq!(draft.name.as_deref(), Some("Fellowship X"));
        assert_eq!(draft.category, Category::Grant);
        assert_eq!(primary.calls(), 1);
        assert_eq!(secondary.calls(), 1);
        assert_eq!(*secondary.seen_models.lock().unwrap(), vec!["model-b".to_string()]);
    }

    #[tokio::test]
    async fn malformed_primary_output_triggers_fallback_and_exhaustion_is_malformed() {
        let primary = StubProvider::new("primary", Script::Reply("Sure! Here is the JSON you asked for"));
        let secondary = StubProvider::new("secondary", Script::Reply("[1, 2, 3]"));
        let chain = chain(vec![(primary.clone(), "a"), (secondary.clone(), "b")]);

        let err = chain
            .extract("page", &SchemaSpec::opportunity_draft())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::MalformedOutput { ref provider, .. } if provider == "secondary"));
        assert_eq!(PipelineError::from(err).code(), "malformed_output");
        assert_eq!(primary.calls(), 1);
        assert_eq!(secondary.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_primary_is_treated_as_provider_failure() {
        let primary = StubProvider::new("primary", Script::Hang);
        let secondary = StubProvider::new("secondary", Script::Reply("```json\n{\"name\":\"Late\"}\n```"));
        let chain = chain(vec![(primary.clone(), "a"), (secondary.clone(), "b")])
            .with_attempt_timeout(Duration::from_secs(5));

        let draft = chain
            .extract("page", &SchemaSpec::opportunity_draft())
            .await
            .unwrap();
        assert_eq!(draft.name.as_deref(), Some("Late"));
        assert_eq!(primary.calls(), 1);
    }

    #[tokio::test]
    async fn empty_chain_reports_no_providers() {
        let err = ProviderChain::new(vec![])
            .extract("page", &SchemaSpec::opportunity_draft())
            .await
            .unwrap_err();
        assert_eq!(err, ExtractionError::NoProviders);
    }

    #[test]
    fn untrusted_fields_are_type_checked_and_category_coerced() {
        let raw = json!({
            "name": "  Emergent Ventures  ",
            "organizer": 42,
            "description": "",
            "openDate": "2025-01-15",
            "closeDate": "whenever",
            "category": "bootcamp",
            "tags": ["ai", 7, "", "policy"],
            "benefits": "cash",
            "logoUrl": "https://example.com/logo.png"
        });
        let draft = draft_from_untrusted(raw).unwrap();
        assert_eq!(draft.name.as_deref(), Some("Emergent Ventures"));
        assert_eq!(draft.organizer, None);
        assert_eq!(draft.description, None);
        assert!(matches!(draft.open_date, Some(OpportunityDate::On(_))));
        assert_eq!(draft.close_date, None);
        assert_eq!(draft.category, DEFAULT_CATEGORY);
        assert_eq!(draft.tags, vec!["ai".to_string(), "policy".to_string()]);
        assert!(draft.benefits.is_empty());

        assert_eq!(coerce_category(Some(&json!("Venture Capital"))), Category::VentureCapital);
        assert!(draft_from_untrusted(json!("not an object")).is_err());
    }

    #[test]
    fn rendered_instructions_name_every_field_and_enum_default() {
        let rendered = SchemaSpec::opportunity_draft().render();
        for field in ["name", "organizer", "fullDescription", "closeDate", "applyLink", "benefits"] {
            assert!(rendered.contains(&format!("\"{field}\"")), "missing {field}");
        }
        assert!(rendered.contains("developer_program"));
        assert!(rendered.contains("use \"fellowship\" when the source is ambiguous"));
        assert!(!rendered.contains("logoUrl"));

        let matching = SchemaSpec::match_recommendations().render();
        assert!(matching.contains("\"matchScore\" (number)"));
    }

    #[test]
    fn chat_body_carries_exact_temperature_and_json_mode() {
        let request = CompletionRequest {
            messages: vec![ChatMessage::system("rules"), ChatMessage::user("page")],
            model: "gpt-4o-mini".into(),
            temperature: 0.1,
            json_object: true,
        };
        let body = chat_body(&request);
        assert_eq!(body["temperature"], json!(0.1));
        assert_eq!(body["temperature"].to_string(), "0.1");
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["messages"][1]["role"], "user");

        let plain = chat_body(&CompletionRequest {
            json_object: false,
            ..request
        });
        assert!(plain.get("response_format").is_none());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "Hello 世界";
        let truncated = truncate_to_char_boundary(text, 8);
        assert!(text.starts_with(truncated));
        assert!(truncated.len() <= 8);
        assert_eq!(truncate_to_char_boundary("Hello", 100), "Hello");
    }
}
