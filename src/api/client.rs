use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::cache::Interceptable;
use crate::config::ApiConfig;

pub type Query = BTreeMap<String, String>;

/// JSON-over-HTTP API client wrapper
#[derive(Clone)]
pub struct ApiClient {
  client: reqwest::Client,
  base_url: Url,
}

impl ApiClient {
  pub fn new(config: &ApiConfig, token: Option<String>) -> Result<Self> {
    let base_url = parse_base_url(&config.base_url)?;

    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    if let Some(token) = token {
      let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|e| eyre!("Failed to build authorization header: {}", e))?;
      value.set_sensitive(true);
      headers.insert(AUTHORIZATION, value);
    }

    let client = reqwest::Client::builder()
      .user_agent(config.user_agent.clone())
      .default_headers(headers)
      .timeout(Duration::from_secs(30))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, base_url })
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  /// Resolve `path` against the base URL, keeping any base path prefix.
  pub fn url_for(&self, path: &str, query: &Query) -> Result<Url> {
    if path.contains("://") {
      return Err(eyre!("Expected a path relative to {}, got {}", self.base_url, path));
    }

    let mut url = self
      .base_url
      .join(path.trim_start_matches('/'))
      .map_err(|e| eyre!("Failed to build URL for {}: {}", path, e))?;

    if !query.is_empty() {
      url.query_pairs_mut().extend_pairs(query.iter());
    }
    Ok(url)
  }

  /// GET `path` and return the body as JSON
  pub async fn get_json(&self, path: &str, query: &Query) -> Result<Value> {
    let url = self.url_for(path, query)?;
    debug!(url = %url, "GET");

    let response = self
      .client
      .get(url.clone())
      .send()
      .await
      .map_err(|e| eyre!("Failed to request {}: {}", url, e))?;

    let status = response.status();
    if !status.is_success() {
      let text = response.text().await.unwrap_or_default();
      return Err(eyre!("GET {} failed with HTTP {}: {}", url, status.as_u16(), text));
    }

    response
      .json::<Value>()
      .await
      .map_err(|e| eyre!("Failed to parse response from {}: {}", url, e))
  }
}

fn parse_base_url(raw: &str) -> Result<Url> {
  // A trailing slash makes `join` append to the base path instead of replacing it.
  let normalized = format!("{}/", raw.trim_end_matches('/'));
  let url = Url::parse(&normalized).map_err(|e| eyre!("Invalid API base URL {}: {}", raw, e))?;
  if url.cannot_be_a_base() {
    return Err(eyre!("Invalid API base URL {}: cannot be a base", raw));
  }
  Ok(url)
}

/// Methods callable through a proxy: `get(path, query?)`.
#[async_trait]
impl Interceptable for ApiClient {
  async fn invoke(&self, path: &[String], args: &[Value]) -> Result<Value> {
    match path.last().map(String::as_str) {
      Some("get") => {
        let (path, query) = get_args(args)?;
        self.get_json(&path, &query).await
      }
      other => Err(eyre!("Unsupported API method: {}", other.unwrap_or("<none>"))),
    }
  }
}

fn get_args(args: &[Value]) -> Result<(String, Query)> {
  let path = args
    .first()
    .and_then(Value::as_str)
    .ok_or_else(|| eyre!("get expects a path string as its first argument"))?
    .to_string();

  let query = match args.get(1) {
    None | Some(Value::Null) => Query::new(),
    Some(value) => serde_json::from_value(value.clone())
      .map_err(|e| eyre!("Failed to parse query for get {}: {}", path, e))?,
  };

  Ok((path, query))
}
