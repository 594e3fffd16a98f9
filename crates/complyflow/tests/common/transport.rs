//! Model transport stand-in.
//!
//! Replies are queued per route, where the route is picked from the
//! request's system prompt. An empty summary route answers with a valid
//! summary; other empty routes report the service as unavailable.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use complyflow::model::{ModelRequest, ModelTransport, TransportError};

pub const SUMMARY_REPLY: &str = r#"{
  "title": "Capital Requirements Review",
  "executive_summary": "Two obligations were identified; one needs action within a month.",
  "key_findings": ["Annual capital report due", "Ongoing transaction monitoring"],
  "recommendations": ["Assign an owner to the capital report"]
}"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Obligations,
    Summary,
    Refinement,
}

impl Route {
    fn of(request: &ModelRequest) -> Self {
        let system = request.system.as_deref().unwrap_or_default();
        if system.contains("compliance analyst") {
            Route::Obligations
        } else if system.contains("reporting specialist") {
            Route::Summary
        } else {
            Route::Refinement
        }
    }
}

#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<HashMap<Route, VecDeque<Result<String, TransportError>>>>,
    calls: Mutex<Vec<Route>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, route: Route, reply: Result<String, TransportError>) {
        self.replies
            .lock()
            .unwrap()
            .entry(route)
            .or_default()
            .push_back(reply);
    }

    pub fn push_obligations(&self, obligations: &[(&str, &str, &str, &str)]) {
        self.push(Route::Obligations, Ok(obligations_reply(obligations)));
    }

    pub fn throttle(&self, route: Route, times: usize) {
        for _ in 0..times {
            self.push(route, Err(TransportError::Throttled { retry_after: None }));
        }
    }

    pub fn calls(&self, route: Route) -> usize {
        self.calls.lock().unwrap().iter().filter(|r| **r == route).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl ModelTransport for ScriptedTransport {
    fn send(&self, request: &ModelRequest) -> Result<String, TransportError> {
        let route = Route::of(request);
        self.calls.lock().unwrap().push(route);
        let next = self
            .replies
            .lock()
            .unwrap()
            .get_mut(&route)
            .and_then(|queue| queue.pop_front());
        match (next, route) {
            (Some(reply), _) => reply,
            (None, Route::Summary) => Ok(SUMMARY_REPLY.to_string()),
            (None, _) => Err(TransportError::Unavailable { status: 503 }),
        }
    }
}

/// An obligations response from `(description, category, severity,
/// deadline_type)` tuples, wrapped in prose the way models answer.
pub fn obligations_reply(obligations: &[(&str, &str, &str, &str)]) -> String {
    let items: Vec<serde_json::Value> = obligations
        .iter()
        .map(|(description, category, severity, deadline_type)| {
            serde_json::json!({
                "description": description,
                "category": category,
                "severity": severity,
                "deadline_type": deadline_type,
                "applicable_entities": ["credit institutions"],
                "extracted_text": description,
                "confidence_score": 0.9
            })
        })
        .collect();
    format!(
        "Here are the obligations I found:\n```json\n{}\n```",
        serde_json::json!({ "obligations": items })
    )
}
