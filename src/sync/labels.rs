//! Desired-vs-actual label computation.

use color_eyre::{eyre::eyre, Result};
use std::collections::{BTreeMap, BTreeSet};

/// What has to change on one item to reach its desired labels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelDiff {
  /// Desired labels not currently present
  pub missing: BTreeSet<String>,
  /// Present, managed, and not desired
  pub obsolete: BTreeSet<String>,
}

impl LabelDiff {
  /// Labels outside `managed` never appear in `obsolete`.
  pub fn compute<I, S>(current: I, desired: &BTreeSet<String>, managed: &BTreeSet<String>) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let current: BTreeSet<String> = current.into_iter().map(Into::into).collect();

    let missing = desired.difference(&current).cloned().collect();
    let obsolete = current
      .iter()
      .filter(|label| managed.contains(*label) && !desired.contains(*label))
      .cloned()
      .collect();

    Self { missing, obsolete }
  }

  pub fn is_empty(&self) -> bool {
    self.missing.is_empty() && self.obsolete.is_empty()
  }
}

/// Maps a source signal to the labels it should produce, within a fixed
/// managed set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelMapping {
  managed: BTreeSet<String>,
  by_signal: BTreeMap<String, BTreeSet<String>>,
}

impl LabelMapping {
  /// Every mapped label must belong to `managed`.
  pub fn new(
    managed: BTreeSet<String>,
    by_signal: BTreeMap<String, BTreeSet<String>>,
  ) -> Result<Self> {
    for (signal, labels) in &by_signal {
      if let Some(stray) = labels.iter().find(|l| !managed.contains(*l)) {
        return Err(eyre!(
          "Signal '{}' maps to label '{}' which is not in the managed set",
          signal,
          stray
        ));
      }
    }
    Ok(Self { managed, by_signal })
  }

  pub fn managed(&self) -> &BTreeSet<String> {
    &self.managed
  }

  pub fn is_managed(&self, label: &str) -> bool {
    self.managed.contains(label)
  }

  /// Labels wanted for `signal`; `None` for signals with no mapping.
  pub fn desired_for(&self, signal: &str) -> Option<&BTreeSet<String>> {
    self.by_signal.get(signal)
  }
}
