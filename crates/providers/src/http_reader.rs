//! The HTTP Stream Reader: drives one round-trip of the in-process
//! provider's streaming chat-completion API.
//!
//! The normalization itself (delta extraction, tool-call-fragment
//! accumulation keyed by index, thinking deltas) lives in the provider
//! adapter's `chat_stream`; this is the thin per-iteration call the Turn
//! Runner makes, kept separate so the Runner's provider-dispatch match
//! reads the same way for every provider kind.

use std::sync::Arc;

use cro_domain::error::Result;
use cro_domain::stream::{BoxStream, StreamEvent};

use crate::traits::{ChatRequest, LlmProvider};

/// Drive one streaming iteration against `provider` and return its
/// normalized event stream.
pub async fn read_http_stream(
    provider: &Arc<dyn LlmProvider>,
    req: &ChatRequest,
) -> Result<BoxStream<'static, Result<StreamEvent>>> {
    provider.chat_stream(req).await
}
