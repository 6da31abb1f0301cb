//! Scripted transport shared by the chain and cache tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use scholar_harvester::client::{PageRequest, PageResponse, Transport};
use scholar_harvester::error::{ClientError, ClientResult};
use scholar_harvester::proxy::ProxyDescriptor;

/// What one scripted attempt does.
#[derive(Debug, Clone)]
pub enum Step {
    /// Answer with `status` and `body`, ending up at `final_url`.
    Page { status: u16, final_url: String, body: String },
    /// Fail as a connection error.
    Unreachable,
    /// Never answer within any sane bound.
    Hang,
}

impl Step {
    pub fn ok(final_url: &str, body: &str) -> Self {
        Self::Page { status: 200, final_url: final_url.into(), body: body.into() }
    }

    pub fn status(status: u16, final_url: &str) -> Self {
        Self::Page { status, final_url: final_url.into(), body: String::new() }
    }
}

/// Replays scripted steps per egress path (keyed by [`ProxyDescriptor::label`])
/// and records every call as `(label, url)`.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue `steps` for `via`. Once a path's queue is empty it is unreachable.
    pub fn script(&self, via: &ProxyDescriptor, steps: impl IntoIterator<Item = Step>) {
        self.scripts.lock().unwrap().entry(via.label()).or_default().extend(steps);
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn labels(&self) -> Vec<String> {
        self.calls().into_iter().map(|(label, _)| label).collect()
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    async fn fetch(&self, request: &PageRequest, via: &ProxyDescriptor) -> ClientResult<PageResponse> {
        self.calls.lock().unwrap().push((via.label(), request.url.clone()));
        let step = self.scripts.lock().unwrap().get_mut(&via.label()).and_then(VecDeque::pop_front);
        match step {
            Some(Step::Page { status, final_url, body }) => {
                Ok(PageResponse { status, final_url, body, retry_after: None })
            }
            Some(Step::Hang) => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Err(ClientError::Timeout(Duration::from_secs(30)))
            }
            Some(Step::Unreachable) | None => Err(ClientError::UnexpectedStatus {
                status: 0,
                message: "connection refused".into(),
            }),
        }
    }
}
