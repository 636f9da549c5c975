//! Session token capture
use crate::errors::Result;
use crate::exchange::HttpExchange;
use crate::interceptor::{RequestAction, RequestInterceptor, ResponseInterceptor};
use cookie::Cookie;
use http::header::{AUTHORIZATION, COOKIE, SET_COOKIE};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const CSRF_TOKEN: &str = "x-csrf-token";
const CLIENT_UUID: &str = "x-client-uuid";
const COOKIE_KEY: &str = "cookie";
/// A cookie header is only worth keeping when it authenticates a session
const REQUIRED_COOKIES: [&str; 3] = ["auth_token", "ct0", "gt"];
const GUEST_TOKEN: &str = "gt";

/// Last seen value of each session token, persisted as a JSON object
#[derive(Debug)]
pub struct TokenStore {
  path: PathBuf,
  tokens: Mutex<BTreeMap<String, String>>,
  write: tokio::sync::Mutex<()>,
}

impl TokenStore {
  /// Open the store at `path`, loading previously saved tokens
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref().to_path_buf();
    let tokens = match tokio::fs::read(&path).await {
      Ok(content) => serde_json::from_slice(&content)?,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
      Err(e) => return Err(e.into()),
    };
    Ok(Self {
      path,
      tokens: Mutex::new(tokens),
      write: tokio::sync::Mutex::new(()),
    })
  }

  /// Value stored under `key`
  pub fn get(&self, key: &str) -> Option<String> {
    self.with_tokens(|tokens| tokens.get(key).cloned())
  }

  /// Every stored token
  pub fn all(&self) -> BTreeMap<String, String> {
    self.with_tokens(|tokens| tokens.clone())
  }

  /// The stored cookie header split into name/value pairs
  pub fn cookies(&self) -> BTreeMap<String, String> {
    self
      .get(COOKIE_KEY)
      .map(|header| parse_cookie_header(&header))
      .unwrap_or_default()
  }

  /// Store `value` under `key` and persist
  pub async fn save_token(&self, key: &str, value: &str) -> Result<()> {
    self.with_tokens(|tokens| tokens.insert(key.to_string(), value.to_string()));
    self.persist().await
  }

  /// Replace the stored cookie header
  pub async fn save_cookies(&self, cookies: &BTreeMap<String, String>) -> Result<()> {
    self.save_token(COOKIE_KEY, &format_cookie_header(cookies)).await
  }

  /// Set one cookie inside the stored cookie header
  pub async fn update_cookie(&self, name: &str, value: &str) -> Result<()> {
    let mut cookies = self.cookies();
    cookies.insert(name.to_string(), value.to_string());
    self.save_cookies(&cookies).await
  }

  async fn persist(&self) -> Result<()> {
    let _guard = self.write.lock().await;
    let content = serde_json::to_vec_pretty(&self.all())?;
    // a crash mid-write must never leave a truncated store behind
    let mut staging = self.path.clone().into_os_string();
    staging.push(".tmp");
    tokio::fs::write(&staging, content).await?;
    tokio::fs::rename(&staging, &self.path).await?;
    Ok(())
  }

  fn with_tokens<T>(&self, f: impl FnOnce(&mut BTreeMap<String, String>) -> T) -> T {
    match self.tokens.lock() {
      Ok(mut tokens) => f(&mut tokens),
      Err(poisoned) => f(&mut poisoned.into_inner()),
    }
  }
}

fn parse_cookie_header(header: &str) -> BTreeMap<String, String> {
  Cookie::split_parse(header)
    .filter_map(|cookie| cookie.ok())
    .map(|cookie| (cookie.name().to_string(), cookie.value().to_string()))
    .collect()
}

fn format_cookie_header(cookies: &BTreeMap<String, String>) -> String {
  cookies
    .iter()
    .map(|(name, value)| format!("{}={}", name, value))
    .collect::<Vec<_>>()
    .join("; ")
}

/// Records the session credentials a browser sends, and guest token
/// refreshes handed out in `Set-Cookie`.
#[derive(Debug, Clone)]
pub struct TokenObserver {
  store: Arc<TokenStore>,
}

impl TokenObserver {
  /// Observer saving into `store`
  pub fn new(store: Arc<TokenStore>) -> Self {
    Self { store }
  }
}

#[async_trait::async_trait]
impl RequestInterceptor for TokenObserver {
  async fn intercept_request(&self, exchange: &mut HttpExchange) -> Result<RequestAction> {
    let headers = exchange.request().headers();
    for name in [AUTHORIZATION.as_str(), CSRF_TOKEN, CLIENT_UUID] {
      if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
        self.store.save_token(name, value).await?;
      }
    }

    if let Some(header) = headers.get(COOKIE).and_then(|v| v.to_str().ok()) {
      let cookies = parse_cookie_header(header);
      if REQUIRED_COOKIES.iter().all(|name| cookies.contains_key(*name)) {
        self.store.save_cookies(&cookies).await?;
      } else {
        tracing::trace!("Cookie header for {} lacks session cookies", exchange.url());
      }
    }
    Ok(RequestAction::Forward)
  }
}

#[async_trait::async_trait]
impl ResponseInterceptor for TokenObserver {
  async fn intercept_response(&self, exchange: &mut HttpExchange) -> Result<()> {
    let Some(response) = exchange.response() else {
      return Ok(());
    };
    let refreshed = response
      .headers()
      .get_all(SET_COOKIE)
      .iter()
      .filter_map(|v| v.to_str().ok())
      .filter_map(|v| Cookie::parse(v).ok())
      .filter(|cookie| cookie.name() == GUEST_TOKEN)
      .last();
    if let Some(cookie) = refreshed {
      tracing::debug!("Guest token refreshed by {}", exchange.url());
      self.store.update_cookie(GUEST_TOKEN, cookie.value()).await?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::connector::Scheme;
  use crate::exchange::Inspection;
  use crate::request::Request;
  use crate::response::Response;

  fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("twiproxy-tokens-{}-{}.json", name, std::process::id()))
  }

  fn exchange(request: http::Request<Vec<u8>>) -> HttpExchange {
    HttpExchange::new(0, None, Scheme::Https, "x.com", 443, "https://x.com/i/api", request.into())
  }

  #[tokio::test]
  async fn captures_request_tokens_and_persists_them() {
    let path = temp_path("capture");
    tokio::fs::remove_file(&path).await.ok();
    let store = Arc::new(TokenStore::open(&path).await.unwrap());
    let observer = TokenObserver::new(store.clone());

    let request = Request::builder()
      .uri("/i/api/graphql/HomeTimeline")
      .header("authorization", "Bearer AAAA")
      .header("x-csrf-token", "csrf")
      .header("cookie", "auth_token=a1; ct0=c0; gt=17; lang=en")
      .body(Vec::new())
      .unwrap();
    let mut ex = exchange(request);
    observer.intercept_request(&mut ex).await.unwrap();

    assert_eq!(store.get("authorization").as_deref(), Some("Bearer AAAA"));
    assert_eq!(store.get("x-csrf-token").as_deref(), Some("csrf"));
    assert_eq!(store.get("x-client-uuid"), None);
    assert_eq!(store.cookies().get("gt").map(String::as_str), Some("17"));

    let reopened = TokenStore::open(&path).await.unwrap();
    assert_eq!(reopened.all(), store.all());
    let mut staging = path.clone().into_os_string();
    staging.push(".tmp");
    assert!(!std::path::Path::new(&staging).exists());
    tokio::fs::remove_file(&path).await.ok();
  }

  #[tokio::test]
  async fn incomplete_cookie_is_ignored_and_guest_token_is_updated() {
    let path = temp_path("guest");
    tokio::fs::remove_file(&path).await.ok();
    let store = Arc::new(TokenStore::open(&path).await.unwrap());
    let observer = TokenObserver::new(store.clone());

    let request = Request::builder()
      .uri("/")
      .header("cookie", "auth_token=a1; ct0=c0")
      .body(Vec::new())
      .unwrap();
    let mut ex = exchange(request);
    observer.intercept_request(&mut ex).await.unwrap();
    assert_eq!(store.get("cookie"), None);

    let mut response = Response::synthesized(http::StatusCode::OK, "ok", true);
    response.headers_mut().append(
      SET_COOKIE,
      http::HeaderValue::from_static("gt=42; Max-Age=10800; Domain=.x.com; Path=/; Secure"),
    );
    ex.set_response(response, Inspection::Skipped);
    observer.intercept_response(&mut ex).await.unwrap();
    assert_eq!(store.get("cookie").as_deref(), Some("gt=42"));
    tokio::fs::remove_file(&path).await.ok();
  }
}
