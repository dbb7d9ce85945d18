//! Checkpointed incremental label sync.
//!
//! One run walks the source page by page in ascending edit order:
//!
//! ```text
//! Idle -> Fetching(cursor) -> Processing(item) -> Checkpointing -> Fetching(next) -> ... -> Idle
//! ```
//!
//! The checkpoint is written after each item's corrective actions are handled
//! and before the next item starts, so a crash costs at most one repeated
//! item (harmless: diff-and-apply converges) and never skips one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info, warn};

use super::checkpoint::{Checkpoint, CheckpointStore};
use super::labels::{LabelDiff, LabelMapping};
use crate::cache::Proxy;
use crate::call_args;
use crate::config::SyncConfig;
use crate::freshness::{Predicate, Timestamped};

/// One record from the paginated source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceItem {
  pub id: String,
  pub edited_at: DateTime<Utc>,
  /// Reference to the item to correct on the target (e.g. an issue URL)
  pub target: Option<String>,
  /// Value the desired labels are derived from (e.g. a priority)
  pub signal: Option<String>,
}

impl Timestamped for SourceItem {
  fn record_id(&self) -> Option<&str> {
    Some(&self.id)
  }

  fn timestamp(&self) -> Option<DateTime<Utc>> {
    Some(self.edited_at)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
  pub items: Vec<SourceItem>,
  pub next_cursor: Option<String>,
}

/// Paginated source, sorted ascending by edit time.
///
/// `cursor` is inclusive: the item it names may be returned again.
#[async_trait]
pub trait PagedSource: Send + Sync {
  async fn query(&self, cursor: Option<&str>, page_size: usize) -> Result<Page>;
}

/// System whose labels are corrected.
#[async_trait]
pub trait LabelTarget: Send + Sync {
  async fn list_labels(&self, item_ref: &str) -> Result<Vec<String>>;

  async fn add_labels(&self, item_ref: &str, labels: &[String]) -> Result<()>;

  async fn remove_label(&self, item_ref: &str, label: &str) -> Result<()>;
}

/// Pages served through the cache; the proxy's policy decides which pages
/// may be stored.
#[async_trait]
impl<S: PagedSource + 'static> PagedSource for Proxy<S> {
  async fn query(&self, cursor: Option<&str>, page_size: usize) -> Result<Page> {
    let cursor = cursor.map(str::to_string);
    let args = call_args![cursor, page_size];
    self
      .call_with("query", args, move |source| async move {
        source.query(cursor.as_deref(), page_size).await
      })
      .await
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
  ListLabels,
  Remove(String),
  Add(Vec<String>),
}

impl fmt::Display for Action {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::ListLabels => write!(f, "list labels"),
      Self::Remove(label) => write!(f, "remove '{}'", label),
      Self::Add(labels) => write!(f, "add {}", labels.join(", ")),
    }
  }
}

/// A corrective action that failed for one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionError {
  pub action: Action,
  pub message: String,
}

/// What happened to one processed item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemOutcome {
  pub id: String,
  pub target: String,
  pub added: Vec<String>,
  pub removed: Vec<String>,
  pub errors: Vec<ActionError>,
}

impl ItemOutcome {
  pub fn is_clean(&self) -> bool {
    self.errors.is_empty()
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
  pub pages: usize,
  /// Items handled this run, in order
  pub processed: Vec<ItemOutcome>,
  /// Items at or behind the starting checkpoint
  pub already_seen: usize,
  /// Items missing a target or a mapped signal
  pub not_applicable: usize,
  /// Checkpoint after the run
  pub checkpoint: Option<Checkpoint>,
}

impl SyncReport {
  pub fn processed_ids(&self) -> Vec<&str> {
    self.processed.iter().map(|o| o.id.as_str()).collect()
  }

  pub fn failures(&self) -> usize {
    self.processed.iter().map(|o| o.errors.len()).sum()
  }
}

/// Walks a [`PagedSource`] and converges labels on a [`LabelTarget`].
pub struct SyncEngine<S, T, K> {
  name: String,
  source: S,
  target: T,
  checkpoints: K,
  mapping: LabelMapping,
  page_size: usize,
}

impl<S, T, K> SyncEngine<S, T, K>
where
  S: PagedSource,
  T: LabelTarget,
  K: CheckpointStore,
{
  pub fn new(name: &str, source: S, target: T, checkpoints: K, mapping: LabelMapping) -> Self {
    Self {
      name: name.to_string(),
      source,
      target,
      checkpoints,
      mapping,
      page_size: 50,
    }
  }

  /// Engine with the mapping and page size from configuration.
  pub fn from_config(
    name: &str,
    source: S,
    target: T,
    checkpoints: K,
    config: &SyncConfig,
  ) -> Result<Self> {
    let mapping = config.label_mapping()?;
    Ok(Self::new(name, source, target, checkpoints, mapping).with_page_size(config.page_size))
  }

  pub fn with_page_size(mut self, page_size: usize) -> Self {
    self.page_size = page_size.max(1);
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Process everything after the stored checkpoint.
  ///
  /// Fails only if the source or the checkpoint store fails; per-item
  /// action failures land in the report instead.
  pub async fn run(&self) -> Result<SyncReport> {
    let mut checkpoint = self
      .checkpoints
      .get(&self.name)
      .await
      .map_err(|e| eyre!("Failed to load checkpoint for {}: {}", self.name, e))?;
    let start = checkpoint.clone();
    let mut cursor = start.as_ref().map(|c| c.last_processed_id.clone());
    let mut report = SyncReport::default();

    info!(engine = %self.name, resume_from = ?cursor, "sync run starting");

    loop {
      debug!(engine = %self.name, cursor = ?cursor, "fetching page");
      let page = self
        .source
        .query(cursor.as_deref(), self.page_size)
        .await
        .map_err(|e| eyre!("Failed to fetch page for {}: {}", self.name, e))?;
      report.pages += 1;

      for item in page.items {
        if is_already_seen(start.as_ref(), &item) {
          report.already_seen += 1;
          continue;
        }

        let Some((target, desired)) = self.plan(&item) else {
          debug!(engine = %self.name, item = %item.id, "not applicable, skipping");
          report.not_applicable += 1;
          continue;
        };

        let outcome = self.process(&item, target, desired).await;

        let next = Checkpoint {
          last_processed_id: item.id.clone(),
          last_edited_at: item.edited_at,
        };
        self
          .checkpoints
          .set(&self.name, &next)
          .await
          .map_err(|e| eyre!("Failed to save checkpoint for {}: {}", self.name, e))?;
        checkpoint = Some(next);
        report.processed.push(outcome);
      }

      match page.next_cursor {
        Some(next) => cursor = Some(next),
        None => break,
      }
    }

    info!(
      engine = %self.name,
      pages = report.pages,
      processed = report.processed.len(),
      failures = report.failures(),
      "sync run finished"
    );
    report.checkpoint = checkpoint;
    Ok(report)
  }

  /// Target reference and desired labels, if the item carries both.
  fn plan<'a>(&'a self, item: &'a SourceItem) -> Option<(&'a str, &'a BTreeSet<String>)> {
    let target = item.target.as_deref().filter(|t| !t.is_empty())?;
    let desired = self.mapping.desired_for(item.signal.as_deref()?)?;
    Some((target, desired))
  }

  async fn process(
    &self,
    item: &SourceItem,
    target: &str,
    desired: &BTreeSet<String>,
  ) -> ItemOutcome {
    let mut outcome = ItemOutcome {
      id: item.id.clone(),
      target: target.to_string(),
      ..ItemOutcome::default()
    };

    let current = match self.target.list_labels(target).await {
      Ok(labels) => labels,
      Err(e) => {
        warn!(engine = %self.name, item = %item.id, error = %e, "failed to list labels");
        outcome.errors.push(ActionError {
          action: Action::ListLabels,
          message: e.to_string(),
        });
        return outcome;
      }
    };

    let diff = LabelDiff::compute(current, desired, self.mapping.managed());
    if diff.is_empty() {
      debug!(engine = %self.name, item = %item.id, "labels already converged");
      return outcome;
    }

    for label in &diff.obsolete {
      match self.target.remove_label(target, label).await {
        Ok(()) => outcome.removed.push(label.clone()),
        Err(e) => {
          warn!(engine = %self.name, item = %item.id, label = %label, error = %e, "failed to remove label");
          outcome.errors.push(ActionError {
            action: Action::Remove(label.clone()),
            message: e.to_string(),
          });
        }
      }
    }

    if !diff.missing.is_empty() {
      let missing: Vec<String> = diff.missing.into_iter().collect();
      match self.target.add_labels(target, &missing).await {
        Ok(()) => outcome.added = missing,
        Err(e) => {
          warn!(engine = %self.name, item = %item.id, error = %e, "failed to add labels");
          outcome.errors.push(ActionError {
            action: Action::Add(missing),
            message: e.to_string(),
          });
        }
      }
    }

    info!(
      engine = %self.name,
      item = %item.id,
      added = ?outcome.added,
      removed = ?outcome.removed,
      "labels corrected"
    );
    outcome
  }
}

/// The checkpoint item as last handled, or anything edited before it.
fn is_already_seen(checkpoint: Option<&Checkpoint>, item: &SourceItem) -> bool {
  let Some(checkpoint) = checkpoint else {
    return false;
  };
  if item.id == checkpoint.last_processed_id {
    // A newer edit of the checkpoint item is not yet seen.
    return item.edited_at <= checkpoint.last_edited_at;
  }
  // Evaluated against a fixed instant, so `now` is irrelevant.
  !Predicate::fresh_since(checkpoint.last_edited_at).matches(item, checkpoint.last_edited_at)
}
