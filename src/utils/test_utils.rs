#[cfg(test)]
use crate::core::bot::BotSummary;
#[cfg(test)]
use crate::core::error::{MimicError, Result};
#[cfg(test)]
use crate::core::session::{ChatSession, SessionEvent};
#[cfg(test)]
use crate::core::transport::{ByteStream, CompletionRequest, CompletionTransport};
#[cfg(test)]
use async_trait::async_trait;
#[cfg(test)]
use std::collections::VecDeque;
#[cfg(test)]
use std::sync::{Arc, Mutex};

#[cfg(test)]
pub fn test_bot() -> BotSummary {
    BotSummary {
        slug: "testy".to_string(),
        name: "Testy".to_string(),
        system: "Always answer briefly".to_string(),
    }
}

#[cfg(test)]
pub fn delta_frame(text: &str) -> Vec<u8> {
    let payload = serde_json::json!({
        "choices": [{ "delta": { "content": text }, "finish_reason": null }]
    });
    format!("data: {payload}\n\n").into_bytes()
}

#[cfg(test)]
pub fn done_frame() -> Vec<u8> {
    b"data: [DONE]\n\n".to_vec()
}

/// What one call to `open_stream` does.
#[cfg(test)]
pub enum Script {
    /// Fail before any bytes arrive.
    Fail(String),
    /// Yield these chunks, then close. `Err` breaks the connection.
    Chunks(Vec<std::result::Result<Vec<u8>, String>>),
    /// Connect and never send anything.
    Hang,
}

/// Replays scripted responses in order and records every request.
#[cfg(test)]
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

#[cfg(test)]
impl ScriptedTransport {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl CompletionTransport for ScriptedTransport {
    async fn open_stream(&self, request: CompletionRequest) -> Result<ByteStream> {
        self.requests.lock().unwrap().push(request);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Script::Fail("no scripted response left".to_string()));

        match script {
            Script::Fail(message) => Err(MimicError::transport(message)),
            Script::Chunks(chunks) => {
                let items: Vec<Result<Vec<u8>>> = chunks
                    .into_iter()
                    .map(|chunk| chunk.map_err(MimicError::transport))
                    .collect();
                Ok(Box::pin(futures_util::stream::iter(items)))
            }
            Script::Hang => Ok(Box::pin(futures_util::stream::pending::<Result<Vec<u8>>>())),
        }
    }
}

/// Collects every event a session emits.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<SessionEvent>>>,
}

#[cfg(test)]
impl EventLog {
    pub fn attach(session: &mut ChatSession) -> Self {
        let log = Self::default();
        session.subscribe(log.handler());
        log
    }

    pub fn handler(&self) -> impl FnMut(&SessionEvent) + Send + 'static {
        let events = Arc::clone(&self.events);
        move |event| events.lock().unwrap().push(event.clone())
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().unwrap().clone()
    }
}
