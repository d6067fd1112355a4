//! In-crate fakes for unit tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::capabilities::{
    Clock, HttpClient, HttpError, HttpHeaders, HttpRequest, HttpResponse, HttpResult,
    LocationError, LocationSource,
};
use crate::model::Coordinates;

#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub url: String,
    pub headers: HttpHeaders,
    pub body: Option<String>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn json(&self) -> serde_json::Value {
        self.body
            .as_deref()
            .and_then(|b| serde_json::from_str(b).ok())
            .unwrap_or(serde_json::Value::Null)
    }
}

type Responder = dyn Fn(&HttpRequest) -> HttpResult + Send + Sync;

/// Records every request and answers with a scripted response.
pub struct RecordingHttp {
    requests: Mutex<Vec<RecordedRequest>>,
    responder: Box<Responder>,
    delay: Duration,
}

impl RecordingHttp {
    pub fn with(responder: impl Fn(&HttpRequest) -> HttpResult + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            responder: Box::new(responder),
            delay: Duration::ZERO,
        })
    }

    /// Replies after `delay` of (tokio) time.
    pub fn slow(delay: Duration, status: u16) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            responder: Box::new(move |req| Ok(response(req, status, ""))),
            delay,
        })
    }

    pub fn replying(status: u16, body: &'static str) -> Arc<Self> {
        Self::with(move |req| Ok(response(req, status, body)))
    }

    pub fn failing() -> Arc<Self> {
        Self::with(|req| {
            Err(HttpError::Connection {
                host: req.url().host().to_string(),
                message: "connection refused".into(),
            })
        })
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

pub fn response(req: &HttpRequest, status: u16, body: &str) -> HttpResponse {
    HttpResponse::new(
        status,
        HttpHeaders::new(),
        body.as_bytes().to_vec(),
        req.request_id().to_string(),
        1,
    )
}

#[async_trait]
impl HttpClient for RecordingHttp {
    async fn execute(&self, request: HttpRequest) -> HttpResult {
        self.requests.lock().unwrap().push(RecordedRequest {
            url: request.url().as_str().to_string(),
            headers: request.headers().clone(),
            body: request
                .body()
                .map(|b| String::from_utf8_lossy(b).into_owned()),
        });
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.responder)(&request)
    }
}

pub struct FixedLocation(pub Result<Coordinates, LocationError>);

#[async_trait]
impl LocationSource for FixedLocation {
    async fn current(&self) -> Result<Coordinates, LocationError> {
        self.0.clone()
    }
}

#[derive(Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn at(ms: u64) -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(ms)))
    }

    pub fn set(&self, ms: u64) {
        self.0.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}
