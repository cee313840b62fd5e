//! Shared test doubles: a scripted transport and a passthrough renderer.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;

use taskping_core::error::Result;
use taskping_core::traits::{ChannelClient, Payload, PayloadRenderer, SendReceipt};
use taskping_core::types::NotificationType;

/// Opt-in test logging: `RUST_LOG=taskping_engine=debug cargo test`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Transport fake: `send` pops scripted results front-first; unscripted calls
/// succeed. Counts every call so tests can assert the transport was (not)
/// contacted.
pub struct ScriptedChannel {
    send_results: Mutex<VecDeque<Result<SendReceipt>>>,
    pub sent: Mutex<Vec<(String, Payload)>>,
    pub published: Mutex<Vec<String>>,
    pub send_calls: AtomicU32,
    pub open_calls: AtomicU32,
    pub publish_calls: AtomicU32,
}

impl ScriptedChannel {
    pub fn new() -> Self {
        Self {
            send_results: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            send_calls: AtomicU32::new(0),
            open_calls: AtomicU32::new(0),
            publish_calls: AtomicU32::new(0),
        }
    }

    pub fn push_send(&self, result: Result<SendReceipt>) {
        self.send_results.lock().unwrap().push_back(result);
    }

    fn default_receipt() -> SendReceipt {
        SendReceipt {
            external_id: "1700000000.000100".into(),
            latency_ms: 12,
        }
    }
}

#[async_trait]
impl ChannelClient for ScriptedChannel {
    async fn send(
        &self,
        channel_id: &str,
        _thread_id: Option<&str>,
        payload: &Payload,
    ) -> Result<SendReceipt> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.send_results.lock().unwrap().pop_front();
        let result = scripted.unwrap_or_else(|| Ok(Self::default_receipt()));
        if result.is_ok() {
            self.sent
                .lock()
                .unwrap()
                .push((channel_id.to_string(), payload.clone()));
        }
        result
    }

    async fn update_message(
        &self,
        _channel_id: &str,
        _external_id: &str,
        _payload: &Payload,
    ) -> Result<()> {
        Ok(())
    }

    async fn open_direct_channel(&self, recipient_id: &str) -> Result<String> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("D-{recipient_id}"))
    }

    async fn publish_surface(&self, recipient_id: &str, _surface: &Payload) -> Result<()> {
        self.publish_calls.fetch_add(1, Ordering::SeqCst);
        self.published.lock().unwrap().push(recipient_id.to_string());
        Ok(())
    }
}

/// Renderer fake: wraps type and context so tests can inspect what reached
/// the transport.
pub struct PassthroughRenderer;

impl PayloadRenderer for PassthroughRenderer {
    fn render(&self, ty: NotificationType, context: &serde_json::Value) -> Payload {
        serde_json::json!({ "type": ty, "context": context })
    }

    fn render_surface(&self, context: &serde_json::Value) -> Payload {
        serde_json::json!({ "surface": context })
    }
}
