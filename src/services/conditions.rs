//! Condition kinds for X-driven auto-resolution and their evaluation

use crate::types::{compare_post_ids, Market, Post, ResolutionProof, TrackingRecord};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Longest evidence excerpt kept on a tracking record
const PROOF_TEXT_CHARS: usize = 100;

/// What has to happen on the monitored account for the market to resolve.
///
/// Stored as a kind string plus optional JSON parameters. Anything that
/// fails to parse becomes `Unsupported` and never matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// At least one new post exists
    TweetPosted,
    /// A new post contains the keyword (case-insensitive)
    KeywordPosted { keyword: String },
    /// Stored kind this build does not understand
    Unsupported { kind: String },
}

#[derive(Deserialize)]
struct KeywordParams {
    keyword: String,
}

impl Condition {
    pub fn kind(&self) -> &str {
        match self {
            Condition::TweetPosted => "tweet_posted",
            Condition::KeywordPosted { .. } => "keyword_posted",
            Condition::Unsupported { kind } => kind,
        }
    }

    /// JSON parameters persisted next to the kind
    pub fn params_json(&self) -> Option<String> {
        match self {
            Condition::KeywordPosted { keyword } => {
                Some(serde_json::json!({ "keyword": keyword }).to_string())
            }
            Condition::TweetPosted | Condition::Unsupported { .. } => None,
        }
    }

    /// Rebuild a condition from its stored columns
    pub fn from_stored(kind: &str, params: Option<&str>) -> Self {
        match kind {
            "tweet_posted" => Condition::TweetPosted,
            "keyword_posted" => params
                .and_then(|p| serde_json::from_str::<KeywordParams>(p).ok())
                .filter(|p| !p.keyword.trim().is_empty())
                .map(|p| Condition::KeywordPosted {
                    keyword: p.keyword.trim().to_string(),
                })
                .unwrap_or_else(|| Condition::Unsupported {
                    kind: kind.to_string(),
                }),
            other => Condition::Unsupported {
                kind: other.to_string(),
            },
        }
    }

    /// Guess the condition from a market title
    pub fn detect(title: &str) -> Option<Self> {
        let lower = title.to_lowercase();
        if lower.contains("tweet") || lower.contains("post") {
            Some(Condition::TweetPosted)
        } else {
            None
        }
    }
}

/// Outcome of evaluating one tracking record against new posts
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub condition_met: bool,
    pub proof: Option<ResolutionProof>,
}

impl Evaluation {
    fn not_met() -> Self {
        Self {
            condition_met: false,
            proof: None,
        }
    }

    fn met(proof: ResolutionProof) -> Self {
        Self {
            condition_met: true,
            proof: Some(proof),
        }
    }
}

/// Evaluate a record's condition against posts that are new for that record
pub fn evaluate(_market: &Market, tracking: &TrackingRecord, posts: &[Post]) -> Evaluation {
    let hit = match &tracking.condition {
        Condition::TweetPosted => newest(posts.iter()),
        Condition::KeywordPosted { keyword } => {
            let needle = keyword.to_lowercase();
            newest(posts.iter().filter(|p| p.text.to_lowercase().contains(&needle)))
        }
        Condition::Unsupported { .. } => None,
    };

    match hit {
        Some(post) => Evaluation::met(proof_for(&tracking.x_target_username, post)),
        None => Evaluation::not_met(),
    }
}

fn newest<'a>(posts: impl Iterator<Item = &'a Post>) -> Option<&'a Post> {
    posts.max_by(|a, b| compare_post_ids(&a.id, &b.id))
}

/// Build evidence for a post: id, permalink, timestamp and a short excerpt
pub fn proof_for(username: &str, post: &Post) -> ResolutionProof {
    ResolutionProof {
        tweet_id: post.id.clone(),
        tweet_url: format!("https://twitter.com/{}/status/{}", username, post.id),
        timestamp: post.created_at,
        text: post.text.chars().take(PROOF_TEXT_CHARS).collect(),
    }
}

fn mention_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"@([A-Za-z0-9_]{1,15})\b").expect("valid mention regex"))
}

/// Extract `@username` mentions, de-duplicated case-insensitively, in order
pub fn extract_mentions(text: &str) -> Vec<String> {
    let mut seen = Vec::<String>::new();
    let mut out = Vec::new();
    for cap in mention_regex().captures_iter(text) {
        let name = cap[1].to_string();
        let key = name.to_lowercase();
        if !seen.contains(&key) {
            seen.push(key);
            out.push(name);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MarketStatus, MonitoringStatus};
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;

    fn market() -> Market {
        Market {
            id: "m1".to_string(),
            creator_wallet: "0xabc".to_string(),
            title: "Will @elon tweet today?".to_string(),
            description: String::new(),
            category: "Community".to_string(),
            tags: vec![],
            status: MarketStatus::Active,
            end_date: Utc::now() + Duration::days(1),
            total_volume: Decimal::ZERO,
            participants: 0,
            winner_id: None,
            tx_hash: None,
            resolution_method: None,
            created_at: Utc::now(),
            x_target_user_id: None,
            x_target_username: None,
            x_condition_type: None,
            x_monitoring_status: MonitoringStatus::Inactive,
            options: vec![],
        }
    }

    fn tracking(condition: Condition) -> TrackingRecord {
        TrackingRecord {
            id: "t1".to_string(),
            market_id: "m1".to_string(),
            x_target_user_id: "44196397".to_string(),
            x_target_username: "elon".to_string(),
            condition,
            last_checked_tweet_id: None,
            last_checked_at: None,
            monitoring_status: MonitoringStatus::Active,
            created_at: Utc::now(),
            resolved_at: None,
            resolution_proof: None,
        }
    }

    fn post(id: &str, text: &str) -> Post {
        Post {
            id: id.to_string(),
            text: text.to_string(),
            created_at: Some(Utc::now()),
            author_id: None,
        }
    }

    #[test]
    fn test_tweet_posted_needs_a_post() {
        let eval = evaluate(&market(), &tracking(Condition::TweetPosted), &[]);
        assert!(!eval.condition_met);
        assert!(eval.proof.is_none());
    }

    #[test]
    fn test_tweet_posted_uses_newest_post_as_proof() {
        let posts = vec![post("1700", "older"), post("1900", "newest"), post("1800", "middle")];
        let eval = evaluate(&market(), &tracking(Condition::TweetPosted), &posts);
        assert!(eval.condition_met);
        let proof = eval.proof.unwrap();
        assert_eq!(proof.tweet_id, "1900");
        assert_eq!(proof.tweet_url, "https://twitter.com/elon/status/1900");
        assert_eq!(proof.text, "newest");
    }

    #[test]
    fn test_proof_text_is_truncated() {
        let long = "x".repeat(250);
        let proof = proof_for("elon", &post("1", &long));
        assert_eq!(proof.text.chars().count(), 100);
    }

    #[test]
    fn test_keyword_condition() {
        let cond = Condition::KeywordPosted {
            keyword: "Mars".to_string(),
        };
        let posts = vec![post("10", "going to the moon"), post("11", "MARS soon")];
        let eval = evaluate(&market(), &tracking(cond.clone()), &posts);
        assert!(eval.condition_met);
        assert_eq!(eval.proof.unwrap().tweet_id, "11");

        let eval = evaluate(&market(), &tracking(cond), &posts[..1]);
        assert!(!eval.condition_met);
    }

    #[test]
    fn test_unsupported_condition_fails_closed() {
        let cond = Condition::from_stored("tweet_count", None);
        assert!(matches!(cond, Condition::Unsupported { .. }));
        let eval = evaluate(&market(), &tracking(cond), &[post("1", "hi")]);
        assert!(!eval.condition_met);

        // Malformed parameters also fail closed
        let cond = Condition::from_stored("keyword_posted", Some("{not json"));
        assert!(matches!(cond, Condition::Unsupported { .. }));
    }

    #[test]
    fn test_stored_roundtrip() {
        let cond = Condition::KeywordPosted {
            keyword: "launch".to_string(),
        };
        let params = cond.params_json();
        assert_eq!(Condition::from_stored(cond.kind(), params.as_deref()), cond);
        assert_eq!(Condition::from_stored("tweet_posted", None), Condition::TweetPosted);
    }

    #[test]
    fn test_detect_condition() {
        assert_eq!(Condition::detect("Will @x Tweet about it?"), Some(Condition::TweetPosted));
        assert_eq!(Condition::detect("Will @x post a photo?"), Some(Condition::TweetPosted));
        assert_eq!(Condition::detect("Will @x win?"), None);
    }

    #[test]
    fn test_extract_mentions() {
        let mentions = extract_mentions("Will @elonmusk or @NASA tweet before @elonmusk sleeps? a@b");
        assert_eq!(mentions, vec!["elonmusk", "NASA", "b"]);
        assert!(extract_mentions("no handles here").is_empty());
    }
}
