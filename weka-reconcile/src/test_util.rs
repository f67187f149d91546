//! Scripted transport for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;

use crate::error::Result;
use crate::transport::{Transport, classify_response};

/// A request as the reconciler issued it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
}

struct Reply {
    status: u16,
    body: Vec<u8>,
}

/// Replies are queued per (method, path) and consumed in order; the last
/// reply for a route repeats. Unscripted routes answer 404.
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<HashMap<(Method, String), VecDeque<Reply>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, method: Method, path: &str, body: Value) -> &Self {
        self.raw(method, path, 200, body.to_string().into_bytes())
    }

    pub fn fail(&self, method: Method, path: &str, status: u16, body: Value) -> &Self {
        self.raw(method, path, status, body.to_string().into_bytes())
    }

    pub fn raw(&self, method: Method, path: &str, status: u16, body: Vec<u8>) -> &Self {
        self.replies
            .lock()
            .unwrap()
            .entry((method, path.to_string()))
            .or_default()
            .push_back(Reply { status, body });
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// `"METHOD path"` for every call, in order.
    pub fn call_log(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .map(|c| format!("{} {}", c.method, c.path))
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Vec<u8>> {
        self.calls.lock().unwrap().push(RecordedCall {
            method: method.clone(),
            path: path.to_string(),
            body: body.cloned(),
        });

        let (status, payload) = {
            let mut replies = self.replies.lock().unwrap();
            match replies.get_mut(&(method, path.to_string())) {
                Some(queue) if queue.len() > 1 => {
                    let reply = queue.pop_front().unwrap();
                    (reply.status, reply.body)
                }
                Some(queue) if !queue.is_empty() => (queue[0].status, queue[0].body.clone()),
                _ => (404, Vec::new()),
            }
        };

        classify_response(status, &payload)?;
        Ok(payload)
    }
}
