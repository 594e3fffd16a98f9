use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::breaker::CircuitBreaker;
use super::schema::{extract_json, ResponseSchema, SchemaRegistry};
use super::transport::{ModelRequest, ModelTransport};
use super::{InvokeError, TransportError};
use crate::retry::Backoff;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InvokerSettings {
    /// Total transport attempts per request, the first one included.
    pub max_retries: u32,
    pub backoff: Backoff,
    /// Upper bound on the time spent sleeping between attempts.
    pub max_total_wait: Duration,
}

impl Default for InvokerSettings {
    fn default() -> Self {
        Self {
            max_retries: 4,
            backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(30)),
            max_total_wait: Duration::from_secs(120),
        }
    }
}

/// A validated model result.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation<T> {
    pub value: T,
    /// Transport attempts spent, corrective re-prompt included.
    pub attempt_count: u32,
    /// Whether the value came from the corrective re-prompt.
    pub corrected: bool,
}

type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

/// Executes model requests with retry, backoff, a shared circuit breaker
/// and response-shape validation.
pub struct ModelInvoker {
    transport: Arc<dyn ModelTransport>,
    breaker: Arc<CircuitBreaker>,
    schemas: Arc<SchemaRegistry>,
    settings: InvokerSettings,
    sleeper: Sleeper,
}

struct Sent {
    /// The reply text, or why a reply that did arrive was unreadable.
    body: Result<String, String>,
    attempts: u32,
}

impl ModelInvoker {
    pub fn new(
        transport: Arc<dyn ModelTransport>,
        breaker: Arc<CircuitBreaker>,
        schemas: Arc<SchemaRegistry>,
        settings: InvokerSettings,
    ) -> Self {
        Self {
            transport,
            breaker,
            schemas,
            settings,
            sleeper: Arc::new(std::thread::sleep),
        }
    }

    /// Replaces the function used to wait between attempts.
    pub fn with_sleeper(mut self, sleeper: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Sends `request` and returns its response parsed as `T` after checking
    /// it against the schema registered as `schema_name`. A response that
    /// does not conform gets exactly one corrective re-prompt.
    pub fn invoke<T: DeserializeOwned>(
        &self,
        request: &ModelRequest,
        schema_name: &str,
    ) -> Result<Invocation<T>, InvokeError> {
        let schema = self
            .schemas
            .get(schema_name)
            .ok_or_else(|| InvokeError::UnknownSchema(schema_name.to_string()))?;

        let first = self.send_guarded(request)?;
        let mut attempt_count = first.attempts;
        let problem = match first.body.and_then(|text| conform::<T>(schema, &text)) {
            Ok(value) => {
                return Ok(Invocation {
                    value,
                    attempt_count,
                    corrected: false,
                })
            }
            Err(problem) => problem,
        };

        log::warn!(
            "Model response does not match '{}' ({}), re-prompting once",
            schema_name,
            problem
        );
        let corrective = corrective_request(request, schema, &problem);
        let second = self.send_guarded(&corrective)?;
        attempt_count += second.attempts;

        second
            .body
            .and_then(|text| conform::<T>(schema, &text))
            .map(|value| Invocation {
                value,
                attempt_count,
                corrected: true,
            })
            .map_err(|detail| InvokeError::InvalidResponse {
                schema: schema_name.to_string(),
                detail,
            })
    }

    /// One breaker-guarded request with the retry loop.
    fn send_guarded(&self, request: &ModelRequest) -> Result<Sent, InvokeError> {
        self.breaker
            .try_acquire()
            .map_err(|retry_in| InvokeError::CircuitOpen { retry_in })?;

        let outcome = self.send_with_retry(request);
        match &outcome {
            Err(InvokeError::TransientExhausted { .. }) => self.breaker.record_failure(),
            _ => self.breaker.record_success(),
        }
        outcome
    }

    fn send_with_retry(&self, request: &ModelRequest) -> Result<Sent, InvokeError> {
        let max_attempts = self.settings.max_retries.max(1);
        let mut waited = Duration::ZERO;
        let mut attempt = 1;
        loop {
            let err = match self.transport.send(request) {
                Ok(text) => {
                    return Ok(Sent {
                        body: Ok(text),
                        attempts: attempt,
                    })
                }
                // The service answered; the answer itself is unusable.
                Err(TransportError::Decode(detail)) => {
                    return Ok(Sent {
                        body: Err(format!("unreadable response: {}", detail)),
                        attempts: attempt,
                    })
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(InvokeError::NonRetryable(err));
            }
            if attempt >= max_attempts {
                return Err(InvokeError::TransientExhausted {
                    attempts: attempt,
                    last: err,
                });
            }

            let mut delay = self.settings.backoff.delay(attempt);
            if let TransportError::Throttled {
                retry_after: Some(hint),
            } = &err
            {
                delay = delay.max(*hint);
            }
            if waited + delay > self.settings.max_total_wait {
                log::warn!(
                    "Model retry budget exhausted after {} attempts ({:?} waited): {}",
                    attempt,
                    waited,
                    err
                );
                return Err(InvokeError::TransientExhausted {
                    attempts: attempt,
                    last: err,
                });
            }

            log::warn!(
                "Model attempt {}/{} failed ({}), retrying in {:?}",
                attempt,
                max_attempts,
                err,
                delay
            );
            (self.sleeper)(delay);
            waited += delay;
            attempt += 1;
        }
    }
}

fn conform<T: DeserializeOwned>(schema: &ResponseSchema, text: &str) -> Result<T, String> {
    let value: Value = extract_json(text).ok_or_else(|| "no JSON found in response".to_string())?;
    schema.check(&value)?;
    serde_json::from_value(value).map_err(|e| e.to_string())
}

fn corrective_request(original: &ModelRequest, schema: &ResponseSchema, problem: &str) -> ModelRequest {
    let prompt = format!(
        "{}\n\nYour previous answer could not be used: {}.\n\
         Respond again with only a JSON document that conforms to this JSON Schema:\n{}",
        original.prompt,
        problem,
        schema.source()
    );
    ModelRequest {
        system: original.system.clone(),
        prompt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::schema::REPORT_SUMMARY;
    use serde::Deserialize;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Scripted {
        replies: Mutex<VecDeque<Result<String, TransportError>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<String, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    impl ModelTransport for Scripted {
        fn send(&self, request: &ModelRequest) -> Result<String, TransportError> {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(TransportError::Unavailable { status: 503 }))
        }
    }

    #[derive(Debug, Deserialize)]
    struct Summary {
        title: String,
    }

    const SUMMARY: &str = r#"{"title": "Q3", "executive_summary": "ok", "key_findings": [], "recommendations": []}"#;

    fn throttled() -> Result<String, TransportError> {
        Err(TransportError::Throttled { retry_after: None })
    }

    fn invoker(transport: Arc<Scripted>, max_retries: u32) -> (ModelInvoker, Arc<Mutex<Vec<Duration>>>) {
        let slept = Arc::new(Mutex::new(Vec::new()));
        let record = slept.clone();
        let invoker = ModelInvoker::new(
            transport,
            Arc::new(CircuitBreaker::new(5, Duration::from_secs(60))),
            Arc::new(SchemaRegistry::builtin().unwrap()),
            InvokerSettings {
                max_retries,
                backoff: Backoff::new(Duration::from_millis(100), Duration::from_secs(1)),
                max_total_wait: Duration::from_secs(10),
            },
        )
        .with_sleeper(move |d| record.lock().unwrap().push(d));
        (invoker, slept)
    }

    #[test]
    fn test_succeeds_on_last_allowed_attempt() {
        let transport = Scripted::new(vec![throttled(), throttled(), Ok(SUMMARY.to_string())]);
        let (invoker, slept) = invoker(transport.clone(), 3);
        let result: Invocation<Summary> = invoker
            .invoke(&ModelRequest::new("summarize"), REPORT_SUMMARY)
            .unwrap();
        assert_eq!(result.attempt_count, 3);
        assert_eq!(result.value.title, "Q3");
        assert!(!result.corrected);
        assert_eq!(slept.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_exhausted_after_max_retries() {
        let transport = Scripted::new(vec![throttled(), throttled(), throttled()]);
        let (invoker, _) = invoker(transport.clone(), 3);
        let err = invoker
            .invoke::<Summary>(&ModelRequest::new("summarize"), REPORT_SUMMARY)
            .unwrap_err();
        assert!(matches!(err, InvokeError::TransientExhausted { attempts: 3, .. }));
        assert_eq!(err.kind(), "throttled");
        assert_eq!(transport.calls(), 3);
    }

    #[test]
    fn test_rejection_is_not_retried() {
        let transport = Scripted::new(vec![Err(TransportError::Rejected {
            status: 400,
            body: "bad".to_string(),
        })]);
        let (invoker, slept) = invoker(transport.clone(), 5);
        let err = invoker
            .invoke::<Summary>(&ModelRequest::new("x"), REPORT_SUMMARY)
            .unwrap_err();
        assert!(matches!(err, InvokeError::NonRetryable(_)));
        assert_eq!(transport.calls(), 1);
        assert!(slept.lock().unwrap().is_empty());
    }

    #[test]
    fn test_retry_after_hint_is_honoured() {
        let transport = Scripted::new(vec![
            Err(TransportError::Throttled {
                retry_after: Some(Duration::from_secs(3)),
            }),
            Ok(SUMMARY.to_string()),
        ]);
        let (invoker, slept) = invoker(transport, 3);
        invoker
            .invoke::<Summary>(&ModelRequest::new("x"), REPORT_SUMMARY)
            .unwrap();
        assert_eq!(slept.lock().unwrap()[0], Duration::from_secs(3));
    }

    #[test]
    fn test_total_wait_bound() {
        let transport = Scripted::new(vec![
            Err(TransportError::Throttled {
                retry_after: Some(Duration::from_secs(30)),
            }),
            Ok(SUMMARY.to_string()),
        ]);
        let (invoker, slept) = invoker(transport.clone(), 5);
        let err = invoker
            .invoke::<Summary>(&ModelRequest::new("x"), REPORT_SUMMARY)
            .unwrap_err();
        assert!(matches!(err, InvokeError::TransientExhausted { attempts: 1, .. }));
        assert!(slept.lock().unwrap().is_empty());
    }

    #[test]
    fn test_one_corrective_reprompt() {
        let transport = Scripted::new(vec![
            Ok("I think the title is Q3".to_string()),
            Ok(format!("Sorry, here it is:\n```json\n{}\n```", SUMMARY)),
        ]);
        let (invoker, _) = invoker(transport.clone(), 3);
        let result: Invocation<Summary> = invoker
            .invoke(&ModelRequest::new("summarize"), REPORT_SUMMARY)
            .unwrap();
        assert!(result.corrected);
        assert_eq!(result.attempt_count, 2);
        let prompts = transport.prompts.lock().unwrap();
        assert!(prompts[1].contains("JSON Schema"));
    }

    #[test]
    fn test_invalid_after_correction_is_permanent() {
        let transport = Scripted::new(vec![
            Ok(r#"{"title": ""}"#.to_string()),
            Ok(r#"{"title": "still missing fields"}"#.to_string()),
        ]);
        let (invoker, _) = invoker(transport.clone(), 3);
        let err = invoker
            .invoke::<Summary>(&ModelRequest::new("summarize"), REPORT_SUMMARY)
            .unwrap_err();
        assert!(matches!(err, InvokeError::InvalidResponse { .. }));
        assert_eq!(transport.calls(), 2);
    }

    #[test]
    fn test_unreadable_reply_gets_corrective_reprompt() {
        let transport = Scripted::new(vec![
            Err(TransportError::Decode("empty response content".to_string())),
            Ok(SUMMARY.to_string()),
        ]);
        let (invoker, slept) = invoker(transport.clone(), 3);
        let result: Invocation<Summary> = invoker
            .invoke(&ModelRequest::new("summarize"), REPORT_SUMMARY)
            .unwrap();
        assert!(result.corrected);
        assert_eq!(result.attempt_count, 2);
        assert!(slept.lock().unwrap().is_empty());
        assert!(transport.prompts.lock().unwrap()[1].contains("unreadable response"));
    }

    #[test]
    fn test_unreadable_replies_do_not_trip_breaker() {
        let transport = Scripted::new(vec![
            Err(TransportError::Decode("empty response content".to_string())),
            Err(TransportError::Decode("expected value at line 1".to_string())),
        ]);
        let breaker = Arc::new(CircuitBreaker::new(1, Duration::from_secs(60)));
        let invoker = ModelInvoker::new(
            transport.clone(),
            breaker.clone(),
            Arc::new(SchemaRegistry::builtin().unwrap()),
            InvokerSettings::default(),
        )
        .with_sleeper(|_| {});
        let err = invoker
            .invoke::<Summary>(&ModelRequest::new("x"), REPORT_SUMMARY)
            .unwrap_err();
        assert!(matches!(err, InvokeError::InvalidResponse { .. }));
        assert_eq!(err.failure_class(), crate::error::FailureClass::Permanent);
        assert_eq!(transport.calls(), 2);
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn test_breaker_opens_across_calls() {
        let transport = Scripted::new(vec![]);
        let breaker = Arc::new(CircuitBreaker::new(2, Duration::from_secs(60)));
        let invoker = ModelInvoker::new(
            transport.clone(),
            breaker,
            Arc::new(SchemaRegistry::builtin().unwrap()),
            InvokerSettings {
                max_retries: 1,
                ..InvokerSettings::default()
            },
        );
        for _ in 0..2 {
            let err = invoker
                .invoke::<Summary>(&ModelRequest::new("x"), REPORT_SUMMARY)
                .unwrap_err();
            assert!(matches!(err, InvokeError::TransientExhausted { .. }));
        }
        let err = invoker
            .invoke::<Summary>(&ModelRequest::new("x"), REPORT_SUMMARY)
            .unwrap_err();
        assert!(matches!(err, InvokeError::CircuitOpen { .. }));
        assert_eq!(transport.calls(), 2);
    }

    #[test]
    fn test_unknown_schema() {
        let (invoker, _) = invoker(Scripted::new(vec![]), 1);
        let err = invoker
            .invoke::<Value>(&ModelRequest::new("x"), "nope")
            .unwrap_err();
        assert_eq!(err, InvokeError::UnknownSchema("nope".to_string()));
    }
}
