//! Cache key derivation for intercepted calls.
//!
//! A key reads `{namespace}.{call.path}({args display})#{args hash}`. The hash
//! covers the full canonical serialization of every argument; the display is
//! only there so keys stay recognisable in logs and is capped in length.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::debug;

/// Longest argument display kept inside a key.
pub const MAX_DISPLAY_CHARS: usize = 120;

/// Hex characters of the SHA-256 digest kept in a key.
pub const HASH_HEX_CHARS: usize = 16;

const ELLIPSIS: char = '…';

/// Arguments of one intercepted call, serialized up front.
///
/// Arguments that fail to serialize are replaced by a stable placeholder so
/// the call itself is never blocked by key derivation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
  values: Vec<Value>,
}

impl CallArgs {
  pub fn new() -> Self {
    Self::default()
  }

  /// Append one argument.
  pub fn arg<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
    let value = match serde_json::to_value(value) {
      Ok(v) => canonicalize(v),
      Err(e) => {
        let type_name = std::any::type_name::<T>();
        debug!(type_name, error = %e, "argument not serializable, using placeholder");
        Value::String(format!("<unserializable:{}>", type_name))
      }
    };
    self.values.push(value);
    self
  }

  pub fn values(&self) -> &[Value] {
    &self.values
  }

  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }

  /// Arguments joined with `,`; the input to both hash and display.
  fn joined(&self) -> String {
    self
      .values
      .iter()
      .map(Value::to_string)
      .collect::<Vec<_>>()
      .join(",")
  }
}

impl From<Vec<Value>> for CallArgs {
  fn from(values: Vec<Value>) -> Self {
    Self {
      values: values.into_iter().map(canonicalize).collect(),
    }
  }
}

/// Build [`CallArgs`] from a list of serializable expressions.
#[macro_export]
macro_rules! call_args {
  ($($arg:expr),* $(,)?) => {
    $crate::cache::CallArgs::new()$(.arg(&$arg))*
  };
}

/// Recursively rebuild objects with their keys in sorted order.
fn canonicalize(value: Value) -> Value {
  match value {
    Value::Object(map) => {
      let mut entries: Vec<(String, Value)> = map.into_iter().collect();
      entries.sort_by(|a, b| a.0.cmp(&b.0));
      Value::Object(
        entries
          .into_iter()
          .map(|(k, v)| (k, canonicalize(v)))
          .collect::<Map<String, Value>>(),
      )
    }
    Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
    other => other,
  }
}

/// Deterministic key for one call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  key: String,
  hash: String,
}

impl CacheKey {
  pub fn encode<S: AsRef<str>>(namespace: &str, path: &[S], args: &CallArgs) -> Self {
    let joined = args.joined();

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    let mut hash = hex::encode(hasher.finalize());
    hash.truncate(HASH_HEX_CHARS);

    let call_path = path
      .iter()
      .map(AsRef::as_ref)
      .collect::<Vec<_>>()
      .join(".");
    let key = format!(
      "{}.{}({})#{}",
      namespace,
      call_path,
      truncate_middle(&joined, MAX_DISPLAY_CHARS),
      hash
    );

    Self { key, hash }
  }

  pub fn as_str(&self) -> &str {
    &self.key
  }

  /// The argument digest alone.
  pub fn args_hash(&self) -> &str {
    &self.hash
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.key)
  }
}

impl AsRef<str> for CacheKey {
  fn as_ref(&self) -> &str {
    &self.key
  }
}

/// Cap `s` at `max` characters, keeping both ends around an ellipsis.
pub fn truncate_middle(s: &str, max: usize) -> String {
  let len = s.chars().count();
  if len <= max {
    return s.to_string();
  }
  if max == 0 {
    return String::new();
  }

  let keep = max - 1;
  let head = keep.div_ceil(2);
  let tail = keep - head;

  let mut out: String = s.chars().take(head).collect();
  out.push(ELLIPSIS);
  out.extend(s.chars().skip(len - tail));
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde::ser::{Error as _, Serializer};
  use serde_json::json;

  #[test]
  fn test_key_layout() {
    let key = CacheKey::encode("gh", &["issues", "listLabels"], &call_args!["acme", 42]);
    let expected_prefix = "gh.issues.listLabels(\"acme\",42)#";
    assert!(key.as_str().starts_with(expected_prefix), "{}", key);
    assert_eq!(key.args_hash().len(), HASH_HEX_CHARS);
    assert!(key.as_str().ends_with(key.args_hash()));
  }

  #[test]
  fn test_deterministic_across_calls() {
    let a = CacheKey::encode("ns", &["search"], &call_args!["q", json!({"page": 2})]);
    let b = CacheKey::encode("ns", &["search"], &call_args!["q", json!({"page": 2})]);
    assert_eq!(a, b);
  }

  #[test]
  fn test_object_key_order_is_irrelevant() {
    let mut first = Map::new();
    first.insert("owner".into(), json!("acme"));
    first.insert("repo".into(), json!("web"));
    first.insert("filter".into(), json!({"state": "open", "labels": ["bug"]}));

    let mut second = Map::new();
    second.insert("filter".into(), json!({"labels": ["bug"], "state": "open"}));
    second.insert("repo".into(), json!("web"));
    second.insert("owner".into(), json!("acme"));

    let a = CacheKey::encode("gh", &["issues", "list"], &call_args![Value::Object(first)]);
    let b = CacheKey::encode("gh", &["issues", "list"], &call_args![Value::Object(second)]);
    assert_eq!(a, b);
  }

  #[test]
  fn test_path_and_args_change_the_key() {
    let base = CacheKey::encode("gh", &["issues", "get"], &call_args![1]);
    assert_ne!(base, CacheKey::encode("gh", &["issues", "list"], &call_args![1]));
    assert_ne!(base, CacheKey::encode("gh", &["issues", "get"], &call_args![2]));
    assert_ne!(base, CacheKey::encode("slack", &["issues", "get"], &call_args![1]));
  }

  #[test]
  fn test_long_args_are_truncated_in_the_middle() {
    let long = "x".repeat(300) + "END";
    let key = CacheKey::encode("ns", &["f"], &call_args!["START", long]);
    let display = key
      .as_str()
      .trim_start_matches("ns.f(")
      .split(")#")
      .next()
      .unwrap()
      .to_string();

    assert_eq!(display.chars().count(), MAX_DISPLAY_CHARS);
    assert!(display.starts_with("\"START\""));
    assert!(display.ends_with("END\""));
    assert!(display.contains(ELLIPSIS));
  }

  #[test]
  fn test_hash_covers_full_args_not_display() {
    let prefix = "y".repeat(200);
    let a = CacheKey::encode("ns", &["f"], &call_args![format!("{prefix}a{prefix}")]);
    let b = CacheKey::encode("ns", &["f"], &call_args![format!("{prefix}b{prefix}")]);
    assert_ne!(a.args_hash(), b.args_hash());
  }

  struct Unserializable;

  impl Serialize for Unserializable {
    fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
      Err(S::Error::custom("cannot serialize"))
    }
  }

  #[test]
  fn test_unserializable_argument_uses_placeholder() {
    let a = CacheKey::encode("ns", &["f"], &call_args![Unserializable, 1]);
    let b = CacheKey::encode("ns", &["f"], &call_args![Unserializable, 1]);
    assert_eq!(a, b);
    assert!(a.as_str().contains("<unserializable:"));
  }

  #[test]
  fn test_truncate_middle_short_input_untouched() {
    assert_eq!(truncate_middle("abc", 10), "abc");
    assert_eq!(truncate_middle("abcdefghij", 5), "ab…ij");
  }
}
