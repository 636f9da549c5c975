//! Home timeline extraction
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::OffsetDateTime;

/// Shortest age used for per-hour rates, so fresh tweets do not divide by zero
const MIN_AGE_HOURS: f64 = 0.1;

/// One tweet as it appeared in a timeline response at `observed_at`.
///
/// Counts are a snapshot; the same tweet observed twice yields two records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TweetObservation {
  /// `rest_id` of the tweet, when present
  pub tweet_id: Option<String>,
  /// Author handle without `@`
  pub username: String,
  /// Author display name
  pub name: String,
  /// Whether the viewing account follows the author
  pub following: bool,
  /// Tweet text
  pub text: String,
  /// Creation time as the API formats it, `Wed Oct 10 20:19:24 +0000 2018`
  pub created_at: String,
  /// Favorite count
  pub likes: u64,
  /// Retweet count
  pub retweets: u64,
  /// Reply count
  pub replies: u64,
  /// View count
  pub views: u64,
  /// RFC 3339 time the response passed through the proxy
  pub observed_at: String,
}

impl TweetObservation {
  /// Parsed `created_at`
  pub fn created(&self) -> Option<OffsetDateTime> {
    let format = format_description!(
      "[weekday repr:short] [month repr:short] [day] [hour]:[minute]:[second] [offset_hour sign:mandatory][offset_minute] [year]"
    );
    OffsetDateTime::parse(&self.created_at, format).ok()
  }

  /// Parsed `observed_at`
  pub fn observed(&self) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(&self.observed_at, &Rfc3339).ok()
  }

  /// Age of the tweet at observation time in hours, never below 0.1
  pub fn age_hours(&self) -> Option<f64> {
    let age = self.observed()? - self.created()?;
    Some((age.as_seconds_f64() / 3600.0).max(MIN_AGE_HOURS))
  }

  /// Likes per hour of age
  pub fn likes_per_hour(&self) -> Option<f64> {
    Some(self.likes as f64 / self.age_hours()?)
  }

  /// Retweets per hour of age
  pub fn retweets_per_hour(&self) -> Option<f64> {
    Some(self.retweets as f64 / self.age_hours()?)
  }

  /// Views per hour of age
  pub fn views_per_hour(&self) -> Option<f64> {
    Some(self.views as f64 / self.age_hours()?)
  }
}

/// Extract every tweet entry of a `HomeTimeline` / `HomeLatestTimeline`
/// response. Entries that do not have the expected shape are skipped.
pub fn parse_timeline(body: &Value, observed_at: OffsetDateTime) -> Vec<TweetObservation> {
  let observed_at = observed_at.format(&Rfc3339).unwrap_or_default();
  let Some(instructions) = body
    .pointer("/data/home/home_timeline_urt/instructions")
    .and_then(Value::as_array)
  else {
    return Vec::new();
  };

  instructions
    .iter()
    .filter(|instruction| instruction["type"] == "TimelineAddEntries")
    .filter_map(|instruction| instruction["entries"].as_array())
    .flatten()
    .filter_map(|entry| entry.pointer("/content/itemContent"))
    .filter(|item| item["itemType"] == "TimelineTweet")
    .filter_map(|item| {
      let observation = tweet(item, &observed_at);
      if observation.is_none() {
        tracing::trace!("Skipping timeline entry without tweet data");
      }
      observation
    })
    .collect()
}

fn tweet(item: &Value, observed_at: &str) -> Option<TweetObservation> {
  let outer = item.pointer("/tweet_results/result")?;
  // visibility-limited tweets are wrapped once more
  let result = outer.get("tweet").unwrap_or(outer);
  let user = result.pointer("/core/user_results/result/legacy")?;

  let mut observation = TweetObservation {
    tweet_id: outer
      .get("rest_id")
      .or_else(|| result.get("rest_id"))
      .and_then(Value::as_str)
      .map(str::to_string),
    username: string(user, "screen_name"),
    name: string(user, "name"),
    following: user["following"].as_bool().unwrap_or(false),
    text: String::new(),
    created_at: String::new(),
    likes: 0,
    retweets: 0,
    replies: 0,
    views: 0,
    observed_at: observed_at.to_string(),
  };

  if let Some(legacy) = result.get("legacy") {
    observation.text = string(legacy, "full_text");
    observation.created_at = string(legacy, "created_at");
    observation.likes = count(&legacy["favorite_count"]);
    observation.retweets = count(&legacy["retweet_count"]);
    observation.replies = count(&legacy["reply_count"]);
    observation.views = count(&result["views"]["count"]);
  } else if let Some(note) = result.get("note_tweet") {
    observation.text = note
      .pointer("/note_tweet_results/result/text")
      .and_then(Value::as_str)?
      .to_string();
    observation.created_at = string(result, "created_at");
  } else {
    return None;
  }
  Some(observation)
}

fn string(value: &Value, key: &str) -> String {
  value[key].as_str().unwrap_or_default().to_string()
}

/// Counts come as numbers, views as decimal strings
fn count(value: &Value) -> u64 {
  match value {
    Value::Number(n) => n.as_u64().unwrap_or(0),
    Value::String(s) => s.parse().unwrap_or(0),
    _ => 0,
  }
}
