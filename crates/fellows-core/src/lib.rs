//! Core domain model, error taxonomy and deterministic ordering for the fellowship finder.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const CRATE_NAME: &str = "fellows-core";

/// Seed for the organizer-order shuffle. Changing it reorders every carousel.
pub const ORGANIZER_ORDER_SEED: u32 = 20240611;
/// Base seed for the per-organizer shuffle; group `i` uses `GROUP_SEED_BASE + i`.
pub const GROUP_SEED_BASE: u32 = 7919;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    #[default]
    Fellowship,
    Accelerator,
    Incubator,
    VentureCapital,
    Grant,
    Residency,
    Competition,
    Research,
    DeveloperProgram,
}

impl Category {
    pub const ALL: [Category; 9] = [
        Category::Fellowship,
        Category::Accelerator,
        Category::Incubator,
        Category::VentureCapital,
        Category::Grant,
        Category::Residency,
        Category::Competition,
        Category::Research,
        Category::DeveloperProgram,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Fellowship => "fellowship",
            Category::Accelerator => "accelerator",
            Category::Incubator => "incubator",
            Category::VentureCapital => "venture_capital",
            Category::Grant => "grant",
            Category::Residency => "residency",
            Category::Competition => "competition",
            Category::Research => "research",
            Category::DeveloperProgram => "developer_program",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| PipelineError::Validation(format!("unknown category `{s}`")))
    }
}

/// An open/close date: a calendar day or the `"closed"` sentinel.
/// Absence (unknown) is modelled as `Option::None` by the containing field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpportunityDate {
    On(NaiveDate),
    Closed,
}

impl OpportunityDate {
    pub const CLOSED_SENTINEL: &'static str = "closed";

    /// Accepts `YYYY-MM-DD`, an RFC 3339 timestamp (date part kept) or `"closed"`.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case(Self::CLOSED_SENTINEL) {
            return Some(OpportunityDate::Closed);
        }
        if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            return Some(OpportunityDate::On(date));
        }
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|ts| OpportunityDate::On(ts.date_naive()))
    }
}

impl fmt::Display for OpportunityDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpportunityDate::On(date) => write!(f, "{}", date.format("%Y-%m-%d")),
            OpportunityDate::Closed => f.write_str(Self::CLOSED_SENTINEL),
        }
    }
}

impl Serialize for OpportunityDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for OpportunityDate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        OpportunityDate::parse(&raw)
            .ok_or_else(|| de::Error::custom(format!("invalid opportunity date `{raw}`")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Opportunity {
    pub id: String,
    pub name: String,
    pub organizer: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub full_description: Option<String>,
    #[serde(default)]
    pub open_date: Option<OpportunityDate>,
    #[serde(default)]
    pub close_date: Option<OpportunityDate>,
    pub category: Category,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub eligibility: Option<String>,
    #[serde(default)]
    pub apply_link: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub benefits: Vec<String>,
}

impl Opportunity {
    /// Promote a reviewed draft to a catalog record under `id`.
    pub fn from_draft(id: impl Into<String>, draft: ExtractionDraft) -> Result<Self, PipelineError> {
        let opportunity = Self {
            id: id.into(),
            name: draft.name.unwrap_or_default(),
            organizer: draft.organizer.unwrap_or_default(),
            description: draft.description.unwrap_or_default(),
            full_description: draft.full_description,
            open_date: draft.open_date,
            close_date: draft.close_date,
            category: draft.category,
            region: draft.region,
            country: draft.country,
            eligibility: draft.eligibility,
            apply_link: draft.apply_link,
            tags: draft.tags,
            benefits: draft.benefits,
        };
        opportunity.validate()?;
        Ok(opportunity)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.id.trim().is_empty() {
            return Err(PipelineError::Validation("opportunity id is required".into()));
        }
        if self.id != slugify(&self.id) {
            return Err(PipelineError::Validation(format!(
                "opportunity id `{}` must be a lowercase slug",
                self.id
            )));
        }
        if self.name.trim().is_empty() {
            return Err(PipelineError::Validation("opportunity name is required".into()));
        }
        if self.organizer.trim().is_empty() {
            return Err(PipelineError::Validation("opportunity organizer is required".into()));
        }
        Ok(())
    }
}

/// Machine-extracted candidate record awaiting human review.
///
/// Same shape as [`Opportunity`] minus `id` and without image/asset fields.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtractionDraft {
    pub name: Option<String>,
    pub organizer: Option<String>,
    pub description: Option<String>,
    pub full_description: Option<String>,
    pub open_date: Option<OpportunityDate>,
    pub close_date: Option<OpportunityDate>,
    pub category: Category,
    pub region: Option<String>,
    pub country: Option<String>,
    pub eligibility: Option<String>,
    pub apply_link: Option<String>,
    pub tags: Vec<String>,
    pub benefits: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchCandidate {
    pub id: String,
    pub match_score: f64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedMatch {
    pub match_score: f64,
    pub reason: String,
    #[serde(flatten)]
    pub opportunity: Opportunity,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("caller is not authorized")]
    Unauthorized,
    #[error("rate limit exceeded, retry later")]
    RateLimited,
    #[error("upstream failure: {0}")]
    UpstreamFailure(String),
    #[error("malformed output: {0}")]
    MalformedOutput(String),
    #[error("search returned no results")]
    NoResults,
    #[error("search result carried no extractable text")]
    NoContent,
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation_error",
            PipelineError::Unauthorized => "unauthorized",
            PipelineError::RateLimited => "rate_limited",
            PipelineError::UpstreamFailure(_) => "upstream_failure",
            PipelineError::MalformedOutput(_) => "malformed_output",
            PipelineError::NoResults => "no_results",
            PipelineError::NoContent => "no_content",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::RateLimited | PipelineError::UpstreamFailure(_)
        )
    }
}

/// Lowercase ASCII slug: alphanumerics joined by single dashes.
pub fn slugify(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

/// Proposed catalog id for a draft, derived from its name (or organizer as a fallback).
pub fn suggest_opportunity_id(draft: &ExtractionDraft) -> Option<String> {
    [draft.name.as_deref(), draft.organizer.as_deref()]
        .into_iter()
        .flatten()
        .map(slugify)
        .find(|slug| !slug.is_empty())
}

pub trait Organized {
    fn organizer(&self) -> &str;
}

impl Organized for Opportunity {
    fn organizer(&self) -> &str {
        &self.organizer
    }
}

/// Small seeded generator (mulberry32). Output is identical on every platform.
#[derive(Debug, Clone)]
pub struct SeededRng {
    state: u32,
}

impl SeededRng {
    pub fn new(seed: u32) -> Self {
        Self { state: seed }
    }

    pub fn next_u32(&mut self) -> u32 {
        self.state = self.state.wrapping_add(0x6D2B_79F5);
        let mut t = self.state;
        t = (t ^ (t >> 15)).wrapping_mul(t | 1);
        t ^= t.wrapping_add((t ^ (t >> 7)).wrapping_mul(t | 61));
        t ^ (t >> 14)
    }

    pub fn below(&mut self, bound: usize) -> usize {
        ((u64::from(self.next_u32()) * bound as u64) >> 32) as usize
    }
}

pub fn seeded_shuffle<T>(items: &mut [T], seed: u32) {
    let mut rng = SeededRng::new(seed);
    for i in (1..items.len()).rev() {
        let j = rng.below(i + 1);
        items.swap(i, j);
    }
}

/// Reorder `items` so no organizer dominates consecutive slots.
///
/// Groups by organizer (first-appearance order), shuffles the organizer order with
/// [`ORGANIZER_ORDER_SEED`], shuffles each group with `GROUP_SEED_BASE + i`, then
/// round-robins one item per organizer per pass. The result is a permutation of
/// the input and depends only on the input.
pub fn distribute_fairly<T: Organized>(items: Vec<T>) -> Vec<T> {
    let total = items.len();
    let mut index_by_organizer = HashMap::<String, usize>::new();
    let mut groups: Vec<Vec<T>> = Vec::new();
    for item in items {
        let slot = match index_by_organizer.get(item.organizer()) {
            Some(&slot) => slot,
            None => {
                let slot = groups.len();
                index_by_organizer.insert(item.organizer().to_string(), slot);
                groups.push(Vec::new());
                slot
            }
        };
        groups[slot].push(item);
    }

    seeded_shuffle(&mut groups, ORGANIZER_ORDER_SEED);
    for (index, group) in groups.iter_mut().enumerate() {
        seeded_shuffle(group, GROUP_SEED_BASE.wrapping_add(index as u32));
    }

    let mut cursors = groups.into_iter().map(Vec::into_iter).collect::<Vec<_>>();
    let mut out = Vec::with_capacity(total);
    while out.len() < total {
        for cursor in &mut cursors {
            if let Some(item) = cursor.next() {
                out.push(item);
            }
        }
    }
    out
}
