#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ride_notify::capabilities::{
    Clock, HttpClient, HttpHeaders, HttpRequest, HttpResponse, HttpResult, LocationError,
    LocationSource,
};
use ride_notify::Coordinates;

pub const CHAT_URL: &str = "https://gate.whapi.cloud/messages/text";

#[derive(Clone, Debug)]
pub struct Sent {
    pub url: String,
    pub body: serde_json::Value,
}

/// Answers every request with `status`, or with `by_url` when the URL matches.
pub struct FakeHttp {
    sent: Mutex<Vec<Sent>>,
    status: u16,
    overrides: Vec<(String, u16)>,
}

impl FakeHttp {
    pub fn ok() -> Arc<Self> {
        Self::status(200)
    }

    pub fn status(status: u16) -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            status,
            overrides: Vec::new(),
        })
    }

    pub fn with_override(status: u16, url: &str, url_status: u16) -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            status,
            overrides: vec![(url.to_string(), url_status)],
        })
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, url: &str) -> Vec<Sent> {
        self.sent().into_iter().filter(|s| s.url == url).collect()
    }
}

#[async_trait]
impl HttpClient for FakeHttp {
    async fn execute(&self, request: HttpRequest) -> HttpResult {
        let url = request.url().as_str().to_string();
        let body = request
            .body()
            .and_then(|b| serde_json::from_slice(b).ok())
            .unwrap_or(serde_json::Value::Null);
        self.sent.lock().unwrap().push(Sent {
            url: url.clone(),
            body,
        });
        let status = self
            .overrides
            .iter()
            .find(|(u, _)| *u == url)
            .map_or(self.status, |(_, s)| *s);
        Ok(HttpResponse::new(
            status,
            HttpHeaders::new(),
            b"{}".to_vec(),
            request.request_id().to_string(),
            1,
        ))
    }
}

pub struct Position(pub Coordinates);

#[async_trait]
impl LocationSource for Position {
    async fn current(&self) -> Result<Coordinates, LocationError> {
        Ok(self.0)
    }
}

pub struct TestClock(AtomicU64);

impl TestClock {
    pub fn at(ms: u64) -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(ms)))
    }

    pub fn advance(&self, ms: u64) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now_ms(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}
