//! AI-assisted market drafting
//!
//! Free text goes to a chat-completions endpoint; whatever comes back is
//! normalized into a usable draft. Any provider failure falls back to a
//! plain Yes/No draft built locally.

use crate::config::AiConfig;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{debug, info, warn};

const DEFAULT_DRAFT_DAYS: i64 = 7;

/// Unvalidated fields as returned by a provider
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawDraft {
    pub title: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub tags: Option<Vec<String>>,
    pub suggested_end_date: Option<String>,
    pub resolution_method: Option<String>,
    pub options: Option<Vec<String>>,
}

impl RawDraft {
    /// Pick fields out of a JSON object, ignoring any with the wrong shape
    pub fn from_json(content: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(content).context("Draft is not valid JSON")?;
        let obj = value
            .as_object()
            .ok_or_else(|| anyhow!("Draft is not a JSON object"))?;

        let text = |key: &str| obj.get(key).and_then(Value::as_str).map(str::to_string);
        let list = |key: &str| {
            obj.get(key).and_then(Value::as_array).map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
        };

        Ok(Self {
            title: text("title"),
            description: text("description"),
            category: text("category"),
            tags: list("tags"),
            suggested_end_date: text("suggestedEndDate"),
            resolution_method: text("resolutionMethod"),
            options: list("options"),
        })
    }
}

/// Produces raw drafts from free text
#[async_trait]
pub trait DraftProvider: Send + Sync {
    async fn generate(&self, free_text: &str, now: DateTime<Utc>) -> Result<RawDraft>;
}

/// Closed set of market categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    Sports,
    Politics,
    Entertainment,
    Technology,
    Finance,
    Crypto,
    Community,
    Personal,
    Science,
    Other,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Sports => "Sports",
            Category::Politics => "Politics",
            Category::Entertainment => "Entertainment",
            Category::Technology => "Technology",
            Category::Finance => "Finance",
            Category::Crypto => "Crypto",
            Category::Community => "Community",
            Category::Personal => "Personal",
            Category::Science => "Science",
            Category::Other => "Other",
        }
    }

    /// Capitalize, map Tech to Technology, and default to Community
    pub fn normalize(raw: &str) -> Self {
        let raw = raw.trim();
        let mut chars = raw.chars();
        let normalized: String = match chars.next() {
            Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
            None => String::new(),
        };

        match normalized.as_str() {
            "Tech" | "Technology" => Category::Technology,
            "Sports" => Category::Sports,
            "Politics" => Category::Politics,
            "Entertainment" => Category::Entertainment,
            "Finance" => Category::Finance,
            "Crypto" => Category::Crypto,
            "Community" => Category::Community,
            "Personal" => Category::Personal,
            "Science" => Category::Science,
            "Other" => Category::Other,
            _ => Category::Community,
        }
    }
}

/// A draft ready to prefill the market creation form
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketDraft {
    pub title: String,
    pub description: String,
    pub category: Category,
    pub tags: Vec<String>,
    pub suggested_end_date: DateTime<Utc>,
    pub resolution_method: String,
    pub options: Vec<String>,
}

/// Drafts markets with an optional provider
#[derive(Clone)]
pub struct MarketDrafter {
    provider: Option<Arc<dyn DraftProvider>>,
}

impl MarketDrafter {
    pub fn new(provider: Option<Arc<dyn DraftProvider>>) -> Self {
        Self { provider }
    }

    pub fn from_config(config: &AiConfig) -> Self {
        let provider = OpenAiProvider::from_config(config)
            .map(|p| Arc::new(p) as Arc<dyn DraftProvider>);
        if provider.is_none() {
            info!("AI provider not configured, market drafts use the local fallback");
        }
        Self::new(provider)
    }

    pub async fn draft(&self, free_text: &str, now: DateTime<Utc>) -> MarketDraft {
        let Some(provider) = &self.provider else {
            debug!("Using fallback draft (no provider)");
            return fallback_draft(free_text, now);
        };

        match provider.generate(free_text, now).await {
            Ok(raw) => normalize_draft(raw, free_text, now),
            Err(e) => {
                warn!("AI draft generation failed, using fallback: {}", e);
                fallback_draft(free_text, now)
            }
        }
    }
}

fn parse_end_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Apply defaults and bounds to a provider's output
pub fn normalize_draft(raw: RawDraft, free_text: &str, now: DateTime<Utc>) -> MarketDraft {
    let default_end = now + Duration::days(DEFAULT_DRAFT_DAYS);
    let suggested_end_date = match raw.suggested_end_date.as_deref().and_then(parse_end_date) {
        Some(end) if end > now => end,
        Some(end) => {
            warn!("AI suggested past end date ({}), using default", end);
            default_end
        }
        None => default_end,
    };

    let mut options: Vec<String> = raw
        .options
        .unwrap_or_default()
        .into_iter()
        .map(|o| o.trim().to_string())
        .filter(|o| !o.is_empty())
        .collect();
    if options.len() < 2 {
        options = vec!["Yes".to_string(), "No".to_string()];
    }
    options.truncate(4);

    MarketDraft {
        title: non_empty(raw.title).unwrap_or_else(|| "Prediction Market".to_string()),
        description: non_empty(raw.description).unwrap_or_else(|| free_text.to_string()),
        category: Category::normalize(raw.category.as_deref().unwrap_or("Community")),
        tags: raw.tags.unwrap_or_default(),
        suggested_end_date,
        resolution_method: non_empty(raw.resolution_method)
            .unwrap_or_else(|| "Community Vote".to_string()),
        options,
    }
}

/// Local Yes/No draft used when no provider answer is available
pub fn fallback_draft(free_text: &str, now: DateTime<Utc>) -> MarketDraft {
    let text = free_text.trim();
    let title: String = if text.to_lowercase().starts_with("will ") {
        let mut chars = text.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    } else {
        format!("Will {}?", text)
    };

    MarketDraft {
        title,
        description: format!(
            "This market resolves based on whether the following event occurs: {}",
            text
        ),
        category: Category::Community,
        tags: vec!["community".to_string(), "prediction".to_string()],
        suggested_end_date: now + Duration::days(DEFAULT_DRAFT_DAYS),
        resolution_method: "Community Vote".to_string(),
        options: vec!["Yes".to_string(), "No".to_string()],
    }
}

/// OpenAI-compatible chat-completions provider
pub struct OpenAiProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiProvider {
    /// None when no API key is configured
    pub fn from_config(config: &AiConfig) -> Option<Self> {
        let api_key = config.api_key.clone()?;
        let client = Client::builder()
            .timeout(StdDuration::from_secs(30))
            .build()
            .ok()?;

        Some(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
        })
    }

    fn system_prompt(now: DateTime<Utc>) -> String {
        let today = now.format("%Y-%m-%d");
        let default_end = (now + Duration::days(DEFAULT_DRAFT_DAYS)).to_rfc3339();
        format!(
            r#"You turn casual event ideas into clear, verifiable prediction market questions.

Today's date is {today}. Every suggested end date MUST be after {today}.

1. Rewrite the idea as a specific, verifiable question
2. Suggest a realistic end date (default {default_end}; adjust to the event)
3. Pick a category: Politics, Tech, Sports, Crypto, Community, Personal, Entertainment
4. Give 2-4 tags
5. Suggest a resolution method (Community Vote, Verified News Source, Social Media Post, ...)
6. Give 2-4 outcome options (usually Yes/No)

Reply with JSON only:
{{
  "title": "Will...",
  "description": "What counts as each outcome",
  "category": "Community",
  "tags": ["tag1", "tag2"],
  "suggestedEndDate": "ISO 8601 date after {today}",
  "resolutionMethod": "How this will be resolved",
  "options": ["Yes", "No"]
}}"#
        )
    }
}

#[async_trait]
impl DraftProvider for OpenAiProvider {
    async fn generate(&self, free_text: &str, now: DateTime<Utc>) -> Result<RawDraft> {
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": Self::system_prompt(now) },
                {
                    "role": "user",
                    "content": format!(
                        "Event idea: \"{}\"\n\nTurn this into a prediction market. Be specific and verifiable.",
                        free_text
                    )
                }
            ],
            "temperature": 0.7,
            "response_format": { "type": "json_object" }
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("AI request failed")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("AI provider returned {}: {}", status, text));
        }

        let chat: ChatResponse = response.json().await.context("Invalid AI response")?;
        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow!("AI response had no content"))?;

        RawDraft::from_json(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted(Result<RawDraft, String>);

    #[async_trait]
    impl DraftProvider for Scripted {
        async fn generate(&self, _free_text: &str, _now: DateTime<Utc>) -> Result<RawDraft> {
            self.0.clone().map_err(|e| anyhow!(e))
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_category_normalization() {
        assert_eq!(Category::normalize("tech"), Category::Technology);
        assert_eq!(Category::normalize("TECHNOLOGY"), Category::Technology);
        assert_eq!(Category::normalize("sPORTS"), Category::Sports);
        assert_eq!(Category::normalize("Weather"), Category::Community);
        assert_eq!(Category::normalize(""), Category::Community);
    }

    #[test]
    fn test_end_date_defaults() {
        let now = Utc::now();
        let default_end = now + Duration::days(7);

        let past = RawDraft {
            suggested_end_date: Some("2001-01-01T00:00:00Z".to_string()),
            ..Default::default()
        };
        assert_eq!(normalize_draft(past, "x", now).suggested_end_date, default_end);

        let garbage = RawDraft {
            suggested_end_date: Some("next tuesday".to_string()),
            ..Default::default()
        };
        assert_eq!(normalize_draft(garbage, "x", now).suggested_end_date, default_end);

        let future = now + Duration::days(30);
        let ok = RawDraft {
            suggested_end_date: Some(future.to_rfc3339()),
            ..Default::default()
        };
        assert_eq!(normalize_draft(ok, "x", now).suggested_end_date, future);

        let date_only = RawDraft {
            suggested_end_date: Some("2999-05-01".to_string()),
            ..Default::default()
        };
        let end = normalize_draft(date_only, "x", now).suggested_end_date;
        assert_eq!(end.format("%Y-%m-%d").to_string(), "2999-05-01");
    }

    #[test]
    fn test_option_bounds() {
        let now = Utc::now();
        let one = RawDraft {
            options: Some(strings(&["Only", "  "])),
            ..Default::default()
        };
        assert_eq!(normalize_draft(one, "x", now).options, strings(&["Yes", "No"]));

        let many = RawDraft {
            options: Some(strings(&["A", "B", "C", "D", "E"])),
            ..Default::default()
        };
        assert_eq!(normalize_draft(many, "x", now).options, strings(&["A", "B", "C", "D"]));

        let padded = RawDraft {
            options: Some(strings(&[" Up ", "Down"])),
            ..Default::default()
        };
        assert_eq!(normalize_draft(padded, "x", now).options, strings(&["Up", "Down"]));
    }

    #[test]
    fn test_missing_fields_get_defaults() {
        let draft = normalize_draft(RawDraft::default(), "my idea", Utc::now());
        assert_eq!(draft.title, "Prediction Market");
        assert_eq!(draft.description, "my idea");
        assert_eq!(draft.category, Category::Community);
        assert_eq!(draft.resolution_method, "Community Vote");
        assert!(draft.tags.is_empty());
    }

    #[test]
    fn test_lenient_json_parsing() {
        let raw = RawDraft::from_json(
            r#"{"title": "Will it snow?", "tags": "oops", "options": ["Yes", 3, "No"], "category": 5}"#,
        )
        .unwrap();
        assert_eq!(raw.title.as_deref(), Some("Will it snow?"));
        assert_eq!(raw.tags, None);
        assert_eq!(raw.options, Some(strings(&["Yes", "No"])));
        assert_eq!(raw.category, None);

        assert!(RawDraft::from_json("[1, 2]").is_err());
        assert!(RawDraft::from_json("not json").is_err());
    }

    #[test]
    fn test_fallback_title() {
        let now = Utc::now();
        assert_eq!(fallback_draft("will it rain", now).title, "Will it rain");
        assert_eq!(fallback_draft("bitcoin hits 100k", now).title, "Will bitcoin hits 100k?");
    }

    #[tokio::test]
    async fn test_provider_error_falls_back() {
        let now = Utc::now();
        let drafter = MarketDrafter::new(Some(Arc::new(Scripted(Err("boom".to_string())))));
        assert_eq!(drafter.draft("it rains", now).await, fallback_draft("it rains", now));

        let drafter = MarketDrafter::new(None);
        assert_eq!(drafter.draft("it rains", now).await.options, strings(&["Yes", "No"]));
    }

    #[tokio::test]
    async fn test_provider_output_is_normalized() {
        let now = Utc::now();
        let raw = RawDraft {
            title: Some("Will the launch slip?".to_string()),
            category: Some("tech".to_string()),
            options: Some(strings(&["Yes", "No", "Cancelled"])),
            ..Default::default()
        };
        let drafter = MarketDrafter::new(Some(Arc::new(Scripted(Ok(raw)))));
        let draft = drafter.draft("launch", now).await;
        assert_eq!(draft.title, "Will the launch slip?");
        assert_eq!(draft.category, Category::Technology);
        assert_eq!(draft.options.len(), 3);
    }

    #[test]
    fn test_prompt_mentions_today() {
        let now = Utc::now();
        let prompt = OpenAiProvider::system_prompt(now);
        assert!(prompt.contains(&now.format("%Y-%m-%d").to_string()));
        assert!(prompt.contains("\"suggestedEndDate\""));
    }
}
