//! HTTP client for the chat backend

use async_stream::stream;
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    request::ChatStreamRequest,
    stream::{StreamEvent, StreamEventStream, parse_event_data},
    types::{AiModel, Message, MessagePage, UploadedFile},
};

/// Chat backend client
#[derive(Debug, Clone)]
pub struct ChatClient {
    client: reqwest::Client,
    base_url: String,
}

impl ChatClient {
    /// Create a client for the given API base URL
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Create a client around an existing reqwest client
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Open a streaming reply for one outgoing message
    pub fn stream_message(
        &self,
        request: &ChatStreamRequest,
        cancel: CancellationToken,
    ) -> Result<StreamEventStream> {
        request.validate()?;

        let url = format!("{}/chat/stream", self.base_url);
        let request_builder = self
            .client
            .post(&url)
            .header("accept", "text/event-stream")
            .json(request);

        let event_source = EventSource::new(request_builder)
            .map_err(|e| Error::Sse(format!("Failed to create event source: {}", e)))?;

        tracing::debug!(url = %url, conversation_id = ?request.conversation_id, "opening chat stream");
        Ok(Box::pin(create_stream(event_source, cancel)))
    }

    /// List the models the backend can route to
    pub async fn fetch_models(&self) -> Result<Vec<AiModel>> {
        let url = format!("{}/models", self.base_url);
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::api(status, text));
        }

        let models: Vec<AiModel> = response.json().await?;
        Ok(models.into_iter().map(AiModel::normalized).collect())
    }

    /// Fetch one page of stored messages for a conversation
    pub async fn fetch_message_page(&self, conversation_id: &str) -> Result<MessagePage> {
        let url = format!("{}/messages", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("conversation_id", conversation_id)])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::api(status, text));
        }

        Ok(response.json().await?)
    }

    /// Fetch stored messages for a conversation, decoding their parts
    pub async fn fetch_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let page = self.fetch_message_page(conversation_id).await?;
        page.data
            .into_iter()
            .map(|record| record.into_message().map_err(Error::from))
            .collect()
    }

    /// Upload a file to be referenced by the next message
    pub async fn upload_file(
        &self,
        file_name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
        conversation_key: &str,
    ) -> Result<UploadedFile> {
        let url = format!("{}/files", self.base_url);
        let response = self
            .client
            .post(&url)
            .query(&[("conversation_id", conversation_key), ("filename", file_name)])
            .header("content-type", mime_type)
            .body(bytes)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::api(status, text));
        }

        Ok(response.json().await?)
    }
}

fn create_stream(
    mut event_source: EventSource,
    cancel: CancellationToken,
) -> impl futures::Stream<Item = Result<StreamEvent>> {
    stream! {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!("chat stream cancelled by caller");
                    break;
                }
                event = event_source.next() => event,
            };

            match event {
                None => break,
                Some(Ok(Event::Open)) => {}
                Some(Ok(Event::Message(msg))) => match parse_event_data(&msg.data) {
                    None => break,
                    Some(Ok(event)) => {
                        let terminal = event.is_terminal();
                        yield Ok(event);
                        if terminal {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        yield Err(e);
                        break;
                    }
                },
                Some(Err(reqwest_eventsource::Error::StreamEnded)) => break,
                Some(Err(e)) => {
                    yield Err(convert_sse_error(e).await);
                    break;
                }
            }
        }

        // The event source reconnects on its own unless closed.
        event_source.close();
    }
}

async fn convert_sse_error(error: reqwest_eventsource::Error) -> Error {
    match error {
        reqwest_eventsource::Error::Transport(e) => Error::Http(e),
        reqwest_eventsource::Error::InvalidStatusCode(status, response) => {
            let text = response.text().await.unwrap_or_default();
            Error::api(status.as_u16(), text)
        }
        reqwest_eventsource::Error::InvalidContentType(content_type, _) => {
            Error::UnexpectedResponse(format!(
                "expected text/event-stream, got {:?}",
                content_type
            ))
        }
        other => Error::Sse(other.to_string()),
    }
}
