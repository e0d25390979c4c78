use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use scraper::{Html, Selector};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info_span, Instrument};

/// Ads container that marks a fully rendered marketplace search page.
pub const DEFAULT_READY_SELECTOR: &str = "div.x78zum5.xdt5ytf.x1iyjqo2.xd4ddsz";
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:130.0) Gecko/20100101 Firefox/130.0";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("timed out after {timeout:?} fetching {url}")]
    Timeout { timeout: Duration, url: String },
    #[error("ready marker `{selector}` not present in {url}")]
    MarkerMissing { selector: String, url: String },
    #[error("renderer exited with {status}: {stderr}")]
    Renderer { status: String, stderr: String },
    #[error("renderer io: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid ready selector `{0}`")]
    Selector(String),
}

/// Source of rendered page markup. One session is opened per source and
/// closed once that source is done, whatever the outcome.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn FetchSession>, FetchError>;
}

#[async_trait]
pub trait FetchSession: Send {
    async fn fetch(&mut self, url: &str) -> Result<String, FetchError>;

    async fn close(&mut self);
}

/// Presence check for the element that signals the page finished rendering.
#[derive(Debug, Clone)]
pub struct ReadyMarker {
    raw: String,
    selector: Selector,
}

impl ReadyMarker {
    pub fn new(selector: &str) -> Result<Self, FetchError> {
        let parsed = Selector::parse(selector).map_err(|_| FetchError::Selector(selector.to_string()))?;
        Ok(Self {
            raw: selector.to_string(),
            selector: parsed,
        })
    }

    pub fn check(&self, url: &str, markup: &str) -> Result<(), FetchError> {
        let document = Html::parse_document(markup);
        if document.select(&self.selector).next().is_some() {
            Ok(())
        } else {
            Err(FetchError::MarkerMissing {
                selector: self.raw.clone(),
                url: url.to_string(),
            })
        }
    }
}

/// Whether a failed request is worth repeating within the same fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchFailure {
    Transient,
    Permanent,
}

/// Throttling and upstream hiccups clear up; a login wall or a missing page
/// looks the same on the next request.
pub fn status_failure(status: StatusCode) -> FetchFailure {
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => FetchFailure::Transient,
        s if s.is_server_error() => FetchFailure::Transient,
        _ => FetchFailure::Permanent,
    }
}

pub fn request_failure(err: &reqwest::Error) -> FetchFailure {
    match err {
        e if e.is_timeout() || e.is_connect() => FetchFailure::Transient,
        _ => FetchFailure::Permanent,
    }
}

/// Waits between repeated requests for one page, doubling from `first_wait`
/// up to `longest_wait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPlan {
    pub retries: u32,
    pub first_wait: Duration,
    pub longest_wait: Duration,
}

impl Default for RetryPlan {
    fn default() -> Self {
        Self {
            retries: 3,
            first_wait: Duration::from_secs(1),
            longest_wait: Duration::from_secs(8),
        }
    }
}

impl RetryPlan {
    /// Wait before zero-based retry `retry`, or `None` once retries are spent.
    pub fn wait_before(&self, retry: u32) -> Option<Duration> {
        (retry < self.retries).then(|| {
            self.first_wait
                .saturating_mul(1 << retry.min(16))
                .min(self.longest_wait)
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcherConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub ready_selector: String,
    pub retry: RetryPlan,
}

impl Default for HttpFetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            ready_selector: DEFAULT_READY_SELECTOR.to_string(),
            retry: RetryPlan::default(),
        }
    }
}

/// Plain HTTP fetcher for pages that are served pre-rendered.
#[derive(Debug, Clone)]
pub struct HttpPageFetcher {
    client: reqwest::Client,
    marker: Arc<ReadyMarker>,
    retry: RetryPlan,
}

impl HttpPageFetcher {
    pub fn new(config: HttpFetcherConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()?;
        Ok(Self {
            client,
            marker: Arc::new(ReadyMarker::new(&config.ready_selector)?),
            retry: config.retry,
        })
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn open_session(&self) -> Result<Box<dyn FetchSession>, FetchError> {
        Ok(Box::new(HttpSession {
            fetcher: self.clone(),
        }))
    }
}

struct HttpSession {
    fetcher: HttpPageFetcher,
}

impl HttpSession {
    async fn get_with_retries(&self, url: &str) -> Result<String, FetchError> {
        let mut retry = 0;
        loop {
            let (failure, err) = match self.fetcher.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp.text().await?),
                Ok(resp) => (
                    status_failure(resp.status()),
                    FetchError::HttpStatus {
                        status: resp.status().as_u16(),
                        url: resp.url().to_string(),
                    },
                ),
                Err(err) => (request_failure(&err), FetchError::Request(err)),
            };
            match (failure, self.fetcher.retry.wait_before(retry)) {
                (FetchFailure::Transient, Some(wait)) => {
                    debug!(error = %err, retry, ?wait, "retrying page fetch");
                    tokio::time::sleep(wait).await;
                    retry += 1;
                }
                _ => return Err(err),
            }
        }
    }
}

#[async_trait]
impl FetchSession for HttpSession {
    async fn fetch(&mut self, url: &str) -> Result<String, FetchError> {
        let span = info_span!("page_fetch", url, via = "http");
        async {
            let body = self.get_with_retries(url).await?;
            self.fetcher.marker.check(url, &body)?;
            Ok(body)
        }
        .instrument(span)
        .await
    }

    async fn close(&mut self) {}
}

#[derive(Debug, Clone)]
pub struct CommandFetcherConfig {
    /// Renderer program, e.g. a headless browser that dumps the DOM.
    pub program: String,
    /// Arguments placed before the URL, which is always passed last.
    pub args: Vec<String>,
    pub timeout: Duration,
    pub ready_selector: String,
}

/// Delegates rendering to an external program and reads the DOM from stdout.
#[derive(Debug, Clone)]
pub struct CommandPageFetcher {
    config: CommandFetcherConfig,
    marker: Arc<ReadyMarker>,
}

impl CommandPageFetcher {
    pub fn new(config: CommandFetcherConfig) -> Result<Self, FetchError> {
        let marker = Arc::new(ReadyMarker::new(&config.ready_selector)?);
        Ok(Self { config, marker })
    }
}

#[async_trait]
impl PageFetcher for CommandPageFetcher {
    async fn open_session(&self) -> Result<Box<dyn FetchSession>, FetchError> {
        Ok(Box::new(CommandSession {
            fetcher: self.clone(),
        }))
    }
}

struct CommandSession {
    fetcher: CommandPageFetcher,
}

#[async_trait]
impl FetchSession for CommandSession {
    async fn fetch(&mut self, url: &str) -> Result<String, FetchError> {
        let config = &self.fetcher.config;
        let span = info_span!("page_fetch", url, via = "command", program = %config.program);
        async {
            let run = Command::new(&config.program)
                .args(&config.args)
                .arg(url)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output();
            let output = tokio::time::timeout(config.timeout, run)
                .await
                .map_err(|_| FetchError::Timeout {
                    timeout: config.timeout,
                    url: url.to_string(),
                })??;

            if !output.status.success() {
                return Err(FetchError::Renderer {
                    status: output.status.to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }
            let markup = String::from_utf8_lossy(&output.stdout).into_owned();
            self.fetcher.marker.check(url, &markup)?;
            Ok(markup)
        }
        .instrument(span)
        .await
    }

    async fn close(&mut self) {}
}
