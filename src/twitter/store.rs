//! Observation persistence
use super::timeline::TweetObservation;
use crate::errors::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

/// Destination for timeline observations
#[async_trait::async_trait]
pub trait ObservationStore: Send + Sync {
  /// Persist one observation
  async fn store_observation(&self, observation: &TweetObservation) -> Result<()>;
}

/// Appends one JSON object per line. Nothing is ever deduplicated; repeated
/// observations of a tweet are how engagement over time is tracked.
#[derive(Debug)]
pub struct JsonLinesStore {
  path: PathBuf,
  // serializes appends from concurrent connections
  lock: tokio::sync::Mutex<()>,
}

impl JsonLinesStore {
  /// Store writing to `path`; the file is created on first write
  pub fn new(path: impl AsRef<Path>) -> Self {
    Self {
      path: path.as_ref().to_path_buf(),
      lock: tokio::sync::Mutex::new(()),
    }
  }

  /// File the observations go to
  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Append `value` as one line
  pub(crate) async fn append<T: Serialize>(&self, value: &T) -> Result<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    let _guard = self.lock.lock().await;
    let mut file = OpenOptions::new()
      .create(true)
      .append(true)
      .open(&self.path)
      .await?;
    file.write_all(&line).await?;
    file.flush().await?;
    Ok(())
  }
}

#[async_trait::async_trait]
impl ObservationStore for JsonLinesStore {
  async fn store_observation(&self, observation: &TweetObservation) -> Result<()> {
    self.append(observation).await
  }
}

/// Keeps observations in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
  observations: Mutex<Vec<TweetObservation>>,
}

impl MemoryStore {
  /// Empty store
  pub fn new() -> Self {
    Self::default()
  }

  /// Everything stored so far, oldest first
  pub fn observations(&self) -> Vec<TweetObservation> {
    match self.observations.lock() {
      Ok(observations) => observations.clone(),
      Err(poisoned) => poisoned.into_inner().clone(),
    }
  }
}

#[async_trait::async_trait]
impl ObservationStore for MemoryStore {
  async fn store_observation(&self, observation: &TweetObservation) -> Result<()> {
    match self.observations.lock() {
      Ok(mut observations) => observations.push(observation.clone()),
      Err(poisoned) => poisoned.into_inner().push(observation.clone()),
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn observation(id: &str, likes: u64) -> TweetObservation {
    TweetObservation {
      tweet_id: Some(id.to_string()),
      username: "ferris".to_string(),
      name: "Ferris".to_string(),
      following: false,
      text: "hello".to_string(),
      created_at: "Thu Jul 25 14:00:00 +0000 2024".to_string(),
      likes,
      retweets: 0,
      replies: 0,
      views: 10,
      observed_at: "2024-07-25T16:00:00Z".to_string(),
    }
  }

  #[tokio::test]
  async fn json_lines_store_appends_duplicates() {
    let path = std::env::temp_dir().join(format!("twiproxy-store-{}.jsonl", std::process::id()));
    tokio::fs::remove_file(&path).await.ok();

    let store = JsonLinesStore::new(&path);
    store.store_observation(&observation("1", 5)).await.unwrap();
    store.store_observation(&observation("1", 9)).await.unwrap();

    let content = tokio::fs::read_to_string(&path).await.unwrap();
    let lines: Vec<TweetObservation> = content
      .lines()
      .map(|line| serde_json::from_str(line).unwrap())
      .collect();
    assert_eq!(lines, vec![observation("1", 5), observation("1", 9)]);
    tokio::fs::remove_file(&path).await.ok();
  }

  #[tokio::test]
  async fn memory_store_keeps_order() {
    let store = MemoryStore::new();
    store.store_observation(&observation("a", 1)).await.unwrap();
    store.store_observation(&observation("b", 2)).await.unwrap();
    let ids: Vec<_> = store
      .observations()
      .into_iter()
      .filter_map(|o| o.tweet_id)
      .collect();
    assert_eq!(ids, vec!["a", "b"]);
  }
}
