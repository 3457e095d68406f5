use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, TryStreamExt, stream};
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use serde_json::Value;
use url::Url;

use crate::api::odata::{ODataQuery, Page, ParseMode, parse_page_body};
use crate::api::paginate::PaginateState;
use crate::api::rate_limit::RateLimiter;
use crate::error::ApiError;
use crate::settings::Settings;

/// Header carrying the upstream API key.
const API_KEY_HEADER: &str = "CCAPIKey";
const BACKOFF_CAP: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub requests_per_second: f64,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub request_timeout: Duration,
    pub max_pages: u64,
    pub max_records: Option<u64>,
    pub parse_mode: ParseMode,
    pub default_top: i64,
}

impl ApiClientConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            base_url: settings.api_base_url.clone(),
            api_key: settings.api_key.clone(),
            requests_per_second: settings.rate_limit_rps,
            max_retries: settings.max_retries,
            retry_delay: Duration::from_secs(settings.retry_delay_seconds.max(1)),
            request_timeout: Duration::from_secs(settings.request_timeout_seconds),
            max_pages: settings.max_pages,
            max_records: settings.max_records,
            parse_mode: ParseMode::Strict,
            default_top: 1000,
        }
    }

    /// Same client settings pointed at a per-job credential.
    pub fn with_credential(settings: &Settings, base_url: String, api_key: String) -> Self {
        Self {
            base_url,
            api_key,
            ..Self::from_settings(settings)
        }
    }
}

#[derive(Debug)]
struct ClientInner {
    http: reqwest::Client,
    base_url: Url,
    limiter: RateLimiter,
    max_retries: u32,
    retry_delay: Duration,
    max_pages: u64,
    max_records: Option<u64>,
    parse_mode: ParseMode,
    default_top: i64,
}

/// Authenticated OData client with token-bucket pacing and bounded
/// retry/backoff. Cheap to clone; clones share the HTTP pool and the
/// rate-limit bucket.
#[derive(Debug, Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

impl ApiClient {
    pub fn new(config: ApiClientConfig) -> Result<Self, ApiError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| ApiError::Validation(format!("invalid base URL: {e}")))?;

        if base_url.scheme() != "https" {
            return Err(ApiError::Validation(format!(
                "API transport must be HTTPS, got {}",
                base_url.scheme()
            )));
        }

        let mut headers = HeaderMap::new();
        let mut key_value = HeaderValue::from_str(&config.api_key)
            .map_err(|_| ApiError::Validation("API key is not a valid header value".into()))?;
        key_value.set_sensitive(true);
        headers.insert(API_KEY_HEADER, key_value);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;

        Ok(Self {
            inner: Arc::new(ClientInner {
                http,
                base_url,
                limiter: RateLimiter::new(config.requests_per_second),
                max_retries: config.max_retries,
                retry_delay: config.retry_delay,
                max_pages: config.max_pages,
                max_records: config.max_records,
                parse_mode: config.parse_mode,
                default_top: config.default_top,
            }),
        })
    }

    pub fn endpoint_url(&self, endpoint: &str) -> Result<Url, ApiError> {
        join_endpoint(&self.inner.base_url, endpoint)
    }

    /// Fetch a paginated OData resource as a lazy finite page stream.
    ///
    /// Pages are produced one request at a time as the stream is polled, so
    /// the caller's memory stays bounded by one page of items. A dry run
    /// yields an empty stream without touching the network.
    pub fn fetch_pages(
        &self,
        endpoint: &str,
        query: ODataQuery,
        dry_run: bool,
    ) -> Result<impl Stream<Item = Result<Page, ApiError>> + Send + use<>, ApiError> {
        let url = self.endpoint_url(endpoint)?;
        let state = PaginateState::new(
            query,
            self.inner.default_top,
            self.inner.max_pages,
            self.inner.max_records,
            dry_run,
        );
        let client = self.clone();

        Ok(stream::try_unfold(
            (client, url, state),
            |(client, url, mut state)| async move {
                if state.finished {
                    return Ok(None);
                }
                state.check_page_cap()?;

                let body = match state.next_link.take() {
                    Some(link) => {
                        let link_url = Url::parse(&link).map_err(|e| {
                            ApiError::Validation(format!("invalid continuation link: {e}"))
                        })?;
                        client.get_json(link_url, &[]).await?
                    }
                    None => client.get_json(url.clone(), &state.query_pairs()).await?,
                };

                let parsed = parse_page_body(body, client.inner.parse_mode)?;
                let page = state.observe(parsed)?;

                Ok(Some((page, (client, url, state))))
            },
        ))
    }

    /// Aggregate mode: materialize every item of the paginated resource.
    pub async fn fetch_all(
        &self,
        endpoint: &str,
        query: ODataQuery,
        dry_run: bool,
    ) -> Result<Vec<Value>, ApiError> {
        let mut items = Vec::new();
        let mut pages = std::pin::pin!(self.fetch_pages(endpoint, query, dry_run)?);
        while let Some(page) = pages.try_next().await? {
            items.extend(page.items);
        }
        Ok(items)
    }

    /// One GET with rate limiting and bounded retry/backoff for transient
    /// failures. `Retry-After` on a 429 sets a floor under the next delay.
    async fn get_json(
        &self,
        url: Url,
        query: &[(&'static str, String)],
    ) -> Result<Value, ApiError> {
        let mut attempt: u32 = 0;
        loop {
            self.inner.limiter.acquire().await;

            match self.send_once(url.clone(), query).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retriable() && attempt < self.inner.max_retries => {
                    let mut delay = backoff_delay(attempt, self.inner.retry_delay);
                    if let Some(retry_after) = err.retry_after() {
                        delay = delay.max(retry_after);
                    }
                    tracing::warn! {
                        %err,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        url = %url,
                        "Retriable API error, backing off."
                    };
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn send_once(
        &self,
        url: Url,
        query: &[(&'static str, String)],
    ) -> Result<Value, ApiError> {
        let mut request = self.inner.http.get(url.clone());
        if !query.is_empty() {
            request = request.query(query);
        }

        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status();

        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            let message: String = body.chars().take(200).collect();
            return Err(ApiError::from_status(
                status.as_u16(),
                url.as_str(),
                message,
                retry_after,
            ));
        }

        let text = response.text().await.map_err(map_transport_error)?;
        serde_json::from_str(&text).map_err(|e| ApiError::Parse(e.to_string()))
    }
}

fn map_transport_error(err: reqwest::Error) -> ApiError {
    if err.is_timeout() {
        ApiError::Timeout
    } else if err.is_decode() {
        ApiError::Parse(err.to_string())
    } else {
        ApiError::Network(err.to_string())
    }
}

fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempt));
    let capped = exp.clamp(Duration::from_secs(1), BACKOFF_CAP);
    capped + Duration::from_millis(rand::random_range(0..250))
}

/// Join base URL and endpoint path without duplicating overlapping segments
/// (an endpoint of `/api/v1/studies/odata` against a base already ending in
/// `/api/v1` contributes only `studies/odata`).
pub(crate) fn join_endpoint(base: &Url, endpoint: &str) -> Result<Url, ApiError> {
    let base_segments: Vec<&str> = base
        .path()
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    let endpoint_segments: Vec<&str> = endpoint
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    let mut overlap = 0;
    for k in (1..=base_segments.len().min(endpoint_segments.len())).rev() {
        if base_segments[base_segments.len() - k..] == endpoint_segments[..k] {
            overlap = k;
            break;
        }
    }

    let mut url = base.clone();
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| ApiError::Validation("base URL cannot carry a path".into()))?;
        segments.pop_if_empty();
        for segment in &endpoint_segments[overlap..] {
            segments.push(segment);
        }
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ApiClientConfig {
        ApiClientConfig {
            base_url: "https://sandbox.example.com/ccsweb/api/v1".to_string(),
            api_key: "k".to_string(),
            requests_per_second: 10.0,
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            max_pages: 10_000,
            max_records: None,
            parse_mode: ParseMode::Strict,
            default_top: 1000,
        }
    }

    #[test]
    fn construction_requires_https() {
        let config = ApiClientConfig {
            base_url: "http://sandbox.example.com/api/v1".to_string(),
            ..test_config()
        };

        assert!(matches!(
            ApiClient::new(config),
            Err(ApiError::Validation(_))
        ));
        assert!(ApiClient::new(test_config()).is_ok());
    }

    #[test]
    fn join_deduplicates_the_version_segment() {
        let base = Url::parse("https://h.example.com/ccsweb/api/v1").unwrap();

        let url = join_endpoint(&base, "/api/v1/studies/odata").unwrap();
        assert_eq!(url.as_str(), "https://h.example.com/ccsweb/api/v1/studies/odata");

        let url = join_endpoint(&base, "studies/odata").unwrap();
        assert_eq!(url.as_str(), "https://h.example.com/ccsweb/api/v1/studies/odata");
    }

    #[test]
    fn join_handles_trailing_slash_and_no_overlap() {
        let base = Url::parse("https://h.example.com/ccsweb/api/v1/").unwrap();
        let url = join_endpoint(&base, "/patients/100/allergies/odata").unwrap();
        assert_eq!(
            url.as_str(),
            "https://h.example.com/ccsweb/api/v1/patients/100/allergies/odata"
        );
    }

    #[test]
    fn backoff_grows_exponentially_and_caps_at_sixty_seconds() {
        let base = Duration::from_secs(5);

        let first = backoff_delay(0, base);
        assert!(first >= Duration::from_secs(5) && first < Duration::from_secs(6));

        let second = backoff_delay(1, base);
        assert!(second >= Duration::from_secs(10) && second < Duration::from_secs(11));

        let huge = backoff_delay(10, base);
        assert!(huge >= BACKOFF_CAP && huge < BACKOFF_CAP + Duration::from_millis(500));
    }

    #[tokio::test]
    async fn dry_run_stream_is_empty_without_network() {
        let client = ApiClient::new(test_config()).unwrap();
        let items = client
            .fetch_all("/studies/odata", ODataQuery::default(), true)
            .await
            .unwrap();
        assert!(items.is_empty());
    }
}
