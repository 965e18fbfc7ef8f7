// ABOUTME: Scripted language model for deterministic tests
// ABOUTME: Replays queued responses, routes by system prompt and records every request

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::service::{AIServiceError, AIServiceResult, LanguageModel};
use crate::types::{InferenceRequest, InferenceResponse};

#[derive(Default)]
struct Script {
    queue: VecDeque<AIServiceResult<InferenceResponse>>,
    routes: Vec<(String, InferenceResponse)>,
    fallback: Option<InferenceResponse>,
    requests: Vec<InferenceRequest>,
}

#[derive(Default)]
pub struct ScriptedModel {
    script: Mutex<Script>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue the next response
    pub fn push(&self, response: InferenceResponse) -> &Self {
        self.lock().queue.push_back(Ok(response));
        self
    }

    pub fn push_error(&self, message: impl Into<String>) -> &Self {
        self.lock()
            .queue
            .push_back(Err(AIServiceError::ApiError(message.into())));
        self
    }

    /// Answer any request whose system prompt contains `needle`
    pub fn route(&self, needle: impl Into<String>, response: InferenceResponse) -> &Self {
        self.lock().routes.push((needle.into(), response));
        self
    }

    /// Response used once the queue is empty
    pub fn fallback(&self, response: InferenceResponse) -> &Self {
        self.lock().fallback = Some(response);
        self
    }

    pub fn requests(&self) -> Vec<InferenceRequest> {
        self.lock().requests.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().requests.len()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn infer(&self, request: &InferenceRequest) -> AIServiceResult<InferenceResponse> {
        let mut script = self.lock();
        script.requests.push(request.clone());

        if let Some((_, response)) = script
            .routes
            .iter()
            .find(|(needle, _)| request.system.contains(needle.as_str()))
        {
            return Ok(response.clone());
        }
        if let Some(next) = script.queue.pop_front() {
            return next;
        }
        script
            .fallback
            .clone()
            .ok_or_else(|| AIServiceError::ApiError("script exhausted".to_string()))
    }
}
