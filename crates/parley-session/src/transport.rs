//! Seam between the session and the chat backend

use async_trait::async_trait;
use parley_api::{ChatClient, ChatStreamRequest, StreamEventStream};
use tokio_util::sync::CancellationToken;

/// Opens one streaming reply per outgoing message
///
/// Implementations must stop yielding once `cancel` fires. Errors returned
/// here (as opposed to error items inside the stream) mean the request never
/// produced any event.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn open(
        &self,
        request: ChatStreamRequest,
        cancel: CancellationToken,
    ) -> parley_api::Result<StreamEventStream>;
}

#[async_trait]
impl ChatTransport for ChatClient {
    async fn open(
        &self,
        request: ChatStreamRequest,
        cancel: CancellationToken,
    ) -> parley_api::Result<StreamEventStream> {
        self.stream_message(&request, cancel)
    }
}
