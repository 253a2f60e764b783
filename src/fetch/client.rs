// 📡 Fetch Client - rate limiter + circuit breaker + retries around one transport

use super::{
    CircuitBreaker, FetchError, FetchRequest, FetchResponse, HttpTransport, Permit, RateLimiter,
    TransportError,
};
use log::{debug, warn};
use rand::Rng;
use std::thread;
use std::time::Duration;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Contact identity required by the SEC fair-access policy
    pub user_agent: String,
    pub request_timeout: Duration,

    /// Longest a caller waits on the rate limiter
    pub max_wait: Duration,

    /// Extra attempts after a network-level failure
    pub max_retries: u32,
    pub retry_base_delay: Duration,

    /// Backoff applied on 429/503 when the response carries no Retry-After
    pub default_backoff: Duration,
}

impl FetchConfig {
    pub fn new(user_agent: impl Into<String>) -> Self {
        FetchConfig {
            user_agent: user_agent.into(),
            request_timeout: Duration::from_secs(30),
            max_wait: Duration::from_secs(5),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            default_backoff: Duration::from_secs(10),
        }
    }
}

enum Attempt {
    Retryable(FetchError),
    Final(FetchError),
}

pub struct FetchClient {
    transport: Box<dyn HttpTransport>,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    config: FetchConfig,
}

impl FetchClient {
    pub fn new(
        transport: Box<dyn HttpTransport>,
        limiter: RateLimiter,
        breaker: CircuitBreaker,
        config: FetchConfig,
    ) -> Self {
        FetchClient {
            transport,
            limiter,
            breaker,
            config,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Build the request every call uses; identity headers are not optional
    pub fn request_for(&self, url: &str) -> FetchRequest {
        FetchRequest {
            url: url.to_string(),
            headers: vec![
                ("User-Agent".to_string(), self.config.user_agent.clone()),
                ("Accept-Encoding".to_string(), "gzip, deflate".to_string()),
            ],
            timeout: self.config.request_timeout,
        }
    }

    /// GET with retries on network-level failures. 2xx only.
    pub fn get(&self, url: &str) -> Result<FetchResponse, FetchError> {
        let request = self.request_for(url);
        self.fetch(&request)
    }

    /// GET and decode the body as UTF-8
    pub fn get_text(&self, url: &str) -> Result<String, FetchError> {
        let response = self.get(url)?;
        String::from_utf8(response.body).map_err(|_| FetchError::MalformedBody {
            url: url.to_string(),
        })
    }

    pub fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match self.attempt(request, attempt) {
                Ok(response) => return Ok(response),
                Err(Attempt::Retryable(err)) if attempt <= self.config.max_retries => {
                    let delay = self.retry_delay(attempt);
                    debug!("retrying {} in {:?} after: {}", request.url, delay, err);
                    thread::sleep(delay);
                }
                Err(Attempt::Retryable(err)) | Err(Attempt::Final(err)) => return Err(err),
            }
        }
    }

    fn attempt(&self, request: &FetchRequest, attempt: u32) -> Result<FetchResponse, Attempt> {
        let permit = match self.breaker.try_acquire() {
            Ok(permit) => permit,
            Err(retry_in) => return Err(Attempt::Final(FetchError::CircuitOpen { retry_in })),
        };

        if let Err(limited) = self.limiter.acquire(self.config.max_wait) {
            self.breaker.abandon(permit);
            return Err(Attempt::Final(FetchError::RateLimited {
                url: request.url.clone(),
                waited: limited.waited,
            }));
        }

        match self.transport.execute(request) {
            Ok(response) => self.classify(request, response, permit),
            Err(TransportError { message, timed_out }) => {
                self.breaker.record_failure(permit);
                if timed_out {
                    warn!("request to {} timed out", request.url);
                }
                Err(Attempt::Retryable(FetchError::Network {
                    url: request.url.clone(),
                    message,
                    attempts: attempt,
                }))
            }
        }
    }

    fn classify(
        &self,
        request: &FetchRequest,
        response: FetchResponse,
        permit: Permit,
    ) -> Result<FetchResponse, Attempt> {
        let status = response.status;
        let status_error = || FetchError::HttpStatus {
            url: request.url.clone(),
            status,
        };

        match status {
            200..=299 => {
                self.breaker.record_success(permit);
                Ok(response)
            }
            429 | 503 => {
                self.breaker.record_failure(permit);
                let backoff = response.retry_after.unwrap_or(self.config.default_backoff);
                warn!("upstream returned {} for {}; backing off {:?}", status, request.url, backoff);
                self.limiter.penalize(backoff);
                Err(Attempt::Final(status_error()))
            }
            500..=599 => {
                self.breaker.record_failure(permit);
                Err(Attempt::Retryable(status_error()))
            }
            // Upstream is healthy, this request is simply wrong
            _ => {
                self.breaker.record_success(permit);
                Err(Attempt::Final(status_error()))
            }
        }
    }

    /// Exponential backoff with jitter in [half, full]
    fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let full = self
            .config
            .retry_base_delay
            .saturating_mul(1u32 << exponent)
            .min(MAX_RETRY_DELAY);
        let half_ms = (full.as_millis() / 2) as u64;
        let jitter = rand::thread_rng().gen_range(0..=half_ms);
        Duration::from_millis(half_ms + jitter)
    }
}

// ============================================================================
// REQWEST TRANSPORT
// ============================================================================

pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .gzip(true)
            .build()?;
        Ok(ReqwestTransport { client })
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        TransportError {
            timed_out: err.is_timeout(),
            message: err.to_string(),
        }
    }
}

impl HttpTransport for ReqwestTransport {
    fn execute(&self, request: &FetchRequest) -> Result<FetchResponse, TransportError> {
        let mut builder = self.client.get(&request.url).timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send()?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.bytes()?.to_vec();

        Ok(FetchResponse {
            status,
            body,
            retry_after,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
