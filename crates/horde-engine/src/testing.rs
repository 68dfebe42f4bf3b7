//! Scripted transport, virtual clock and recording reporter shared by the
//! unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::error::{HordeError, Result};
use crate::jobs::CancelToken;
use crate::progress::ProgressReporter;
use crate::transport::{Clock, HttpReply, Transport};

#[derive(Debug, Clone)]
enum Scripted {
    Reply(HttpReply),
    Fail(String),
}

#[derive(Debug)]
struct Route {
    method: &'static str,
    fragment: String,
    replies: VecDeque<Scripted>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub method: &'static str,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl RecordedCall {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Replies are served per route in order; the last one repeats.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    routes: Mutex<Vec<Route>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_get(&self, fragment: &str, reply: HttpReply) -> &Self {
        self.push("GET", fragment, Scripted::Reply(reply))
    }

    pub fn on_post(&self, fragment: &str, reply: HttpReply) -> &Self {
        self.push("POST", fragment, Scripted::Reply(reply))
    }

    pub fn fail_get(&self, fragment: &str, message: &str) -> &Self {
        self.push("GET", fragment, Scripted::Fail(message.to_string()))
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    pub fn count(&self, method: &str, fragment: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.method == method && call.url.contains(fragment))
            .count()
    }

    fn push(&self, method: &'static str, fragment: &str, reply: Scripted) -> &Self {
        if let Ok(mut routes) = self.routes.lock() {
            match routes
                .iter_mut()
                .find(|route| route.method == method && route.fragment == fragment)
            {
                Some(route) => route.replies.push_back(reply),
                None => routes.push(Route {
                    method,
                    fragment: fragment.to_string(),
                    replies: VecDeque::from([reply]),
                }),
            }
        }
        self
    }

    fn serve(
        &self,
        method: &'static str,
        url: &str,
        headers: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<HttpReply> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                method,
                url: url.to_string(),
                headers: headers
                    .iter()
                    .map(|(key, value)| (key.to_string(), value.to_string()))
                    .collect(),
                body: body.cloned(),
            });
        }
        let scripted = self.routes.lock().ok().and_then(|mut routes| {
            let route = routes
                .iter_mut()
                .find(|route| route.method == method && url.contains(&route.fragment))?;
            if route.replies.len() > 1 {
                route.replies.pop_front()
            } else {
                route.replies.front().cloned()
            }
        });
        match scripted {
            Some(Scripted::Reply(reply)) => Ok(reply),
            Some(Scripted::Fail(message)) => Err(HordeError::Transport {
                url: url.to_string(),
                message,
            }),
            None => Ok(HttpReply::json(
                404,
                &serde_json::json!({"message": format!("no scripted reply for {method} {url}")}),
            )),
        }
    }
}

impl Transport for ScriptedTransport {
    fn get(&self, url: &str, headers: &[(&str, &str)]) -> Result<HttpReply> {
        self.serve("GET", url, headers, None)
    }

    fn post_json(&self, url: &str, headers: &[(&str, &str)], body: &Value) -> Result<HttpReply> {
        self.serve("POST", url, headers, Some(body))
    }
}

/// Clock that only moves when something sleeps on it.
#[derive(Debug)]
pub struct VirtualClock {
    start: Instant,
    offset: Mutex<Duration>,
    sleeps: Mutex<Vec<Duration>>,
    cancel_at: Mutex<Option<(Duration, CancelToken)>>,
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self {
            start: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
            sleeps: Mutex::new(Vec::new()),
            cancel_at: Mutex::new(None),
        }
    }
}

impl VirtualClock {
    pub fn elapsed(&self) -> Duration {
        self.offset.lock().map(|offset| *offset).unwrap_or_default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().map(|rows| rows.clone()).unwrap_or_default()
    }

    /// Trips `token` once virtual time reaches `at`.
    pub fn cancel_at(&self, at: Duration, token: CancelToken) {
        if let Ok(mut slot) = self.cancel_at.lock() {
            *slot = Some((at, token));
        }
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Instant {
        self.start + self.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        let now = match self.offset.lock() {
            Ok(mut offset) => {
                *offset += duration;
                *offset
            }
            Err(_) => return,
        };
        if let Ok(mut rows) = self.sleeps.lock() {
            rows.push(duration);
        }
        if let Ok(slot) = self.cancel_at.lock() {
            if let Some((at, token)) = slot.as_ref() {
                if now >= *at {
                    token.cancel();
                }
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct RecordingReporter {
    job_ids: Mutex<Vec<String>>,
    statuses: Mutex<Vec<(String, u8)>>,
    warnings: Mutex<Vec<String>>,
    fatals: Mutex<Vec<(String, Option<String>)>>,
    finished: AtomicUsize,
}

impl RecordingReporter {
    pub fn job_ids(&self) -> Vec<String> {
        self.job_ids.lock().map(|rows| rows.clone()).unwrap_or_default()
    }

    pub fn statuses(&self) -> Vec<(String, u8)> {
        self.statuses.lock().map(|rows| rows.clone()).unwrap_or_default()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().map(|rows| rows.clone()).unwrap_or_default()
    }

    pub fn fatals(&self) -> Vec<(String, Option<String>)> {
        self.fatals.lock().map(|rows| rows.clone()).unwrap_or_default()
    }

    pub fn finished_count(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

impl ProgressReporter for RecordingReporter {
    fn job_started(&self, job_id: &str) {
        if let Ok(mut rows) = self.job_ids.lock() {
            rows.push(job_id.to_string());
        }
    }

    fn update_status(&self, text: &str, percent: u8) {
        if let Ok(mut rows) = self.statuses.lock() {
            rows.push((text.to_string(), percent));
        }
    }

    fn report_warning(&self, text: &str) {
        if let Ok(mut rows) = self.warnings.lock() {
            rows.push(text.to_string());
        }
    }

    fn report_fatal(&self, text: &str, help_url: Option<&str>) {
        if let Ok(mut rows) = self.fatals.lock() {
            rows.push((text.to_string(), help_url.map(str::to_string)));
        }
    }

    fn finished(&self) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}
