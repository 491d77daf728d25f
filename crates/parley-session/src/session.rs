//! Session state machine: one outstanding send, streamed into a message

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use parley_api::{
    Artifact, ChatStreamRequest, ConversationItem, FinishStatus, JsonMap, Message, MessageStatus,
};
use tokio::sync::{Notify, broadcast};
use tokio_util::sync::CancellationToken;

use crate::{
    assembler::{Applied, ConversationMeta, MessageAssembler, Step},
    conversation_cache::ConversationListCache,
    draft::{DraftStore, draft_key},
    error::{Error, ErrorKind},
    events::{SessionEvent, SessionStatus},
    handle::SessionHandle,
    transport::ChatTransport,
    upload::FileUploadCoordinator,
};

type FinishCallback = Box<dyn FnOnce(&Message) + Send>;
type ErrorCallback = Box<dyn FnOnce(&Error) + Send>;
type AssignedHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Per-send options
///
/// `on_finish` and `on_error` each run at most once, and exactly one of them
/// runs for a send that opened a request and was not stopped.
#[derive(Default)]
pub struct SendOptions {
    pub web_search: bool,
    pub agent: Option<String>,
    pub model: Option<String>,
    on_finish: Option<FinishCallback>,
    on_error: Option<ErrorCallback>,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn web_search(mut self, enabled: bool) -> Self {
        self.web_search = enabled;
        self
    }

    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Run with the finished assistant message
    pub fn on_finish(mut self, f: impl FnOnce(&Message) + Send + 'static) -> Self {
        self.on_finish = Some(Box::new(f));
        self
    }

    /// Run with the error that ended the send
    pub fn on_error(mut self, f: impl FnOnce(&Error) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

/// How a call to `send_message` ended
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Nothing happened: empty input or a send already outstanding
    Ignored,
    /// The assistant message completed
    Completed(Message),
    /// The send failed; `on_error` has run
    Failed { kind: ErrorKind, message: String },
    /// `stop()` ended the send
    Stopped,
}

#[derive(Default)]
struct SessionState {
    conversation_id: Option<String>,
    messages: Vec<Message>,
    status: SessionStatus,
    /// Artifact bodies by message index, then artifact id
    artifacts: HashMap<usize, HashMap<String, Artifact>>,
    /// Present only while a stream is open
    cancel: Option<CancellationToken>,
    /// Bumped by every send and every stop; late events carry a stale value
    generation: u64,
    /// Index of the in-flight assistant message in `messages`
    assistant_index: Option<usize>,
    last_failed_input: Option<String>,
}

impl SessionState {
    fn assistant_mut(&mut self) -> Option<&mut Message> {
        let index = self.assistant_index?;
        self.messages.get_mut(index)
    }
}

pub(crate) struct SessionShared {
    state: Mutex<SessionState>,
    transport: Arc<dyn ChatTransport>,
    drafts: DraftStore,
    uploads: Option<FileUploadCoordinator>,
    conversations: Arc<dyn ConversationListCache>,
    on_conversation_assigned: Option<AssignedHook>,
    event_tx: broadcast::Sender<SessionEvent>,
    pub(crate) idle_notify: Notify,
}

impl SessionShared {
    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }

    pub(crate) fn status(&self) -> SessionStatus {
        self.state.lock().status
    }

    pub(crate) fn stop(&self) -> bool {
        {
            let mut state = self.state.lock();
            if !state.status.is_busy() {
                return false;
            }
            if let Some(cancel) = state.cancel.take() {
                cancel.cancel();
            }
            state.generation += 1;

            if let Some(message) = state.assistant_mut() {
                message.status = MessageStatus::Error;
                message
                    .metadata
                    .get_or_insert_with(JsonMap::new)
                    .insert("finish_reason".into(), "cancelled".into());
                message.touch();
                let message = message.clone();
                self.emit(SessionEvent::AssistantEnd { message });
            }
            state.assistant_index = None;
            state.status = SessionStatus::Idle;
            self.emit(SessionEvent::StatusChanged {
                status: SessionStatus::Idle,
            });
        }
        tracing::debug!("session stopped");
        self.idle_notify.notify_waiters();
        true
    }
}

/// Builder for [`Session`]
pub struct SessionBuilder {
    transport: Arc<dyn ChatTransport>,
    drafts: Option<DraftStore>,
    uploads: Option<FileUploadCoordinator>,
    conversations: Option<Arc<dyn ConversationListCache>>,
    on_conversation_assigned: Option<AssignedHook>,
    conversation_id: Option<String>,
}

impl SessionBuilder {
    pub fn drafts(mut self, drafts: DraftStore) -> Self {
        self.drafts = Some(drafts);
        self
    }

    pub fn uploads(mut self, uploads: FileUploadCoordinator) -> Self {
        self.uploads = Some(uploads);
        self
    }

    pub fn conversations(mut self, cache: Arc<dyn ConversationListCache>) -> Self {
        self.conversations = Some(cache);
        self
    }

    /// Called once when the backend assigns this session's conversation id
    pub fn on_conversation_assigned(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_conversation_assigned = Some(Arc::new(f));
        self
    }

    /// Start bound to an existing conversation
    pub fn conversation_id(mut self, id: impl Into<String>) -> Self {
        self.conversation_id = Some(id.into());
        self
    }

    pub fn build(self) -> Session {
        let (event_tx, _) = broadcast::channel(256);
        let conversations: Arc<dyn ConversationListCache> = match self.conversations {
            Some(cache) => cache,
            None => Arc::new(|_item: ConversationItem| {}),
        };
        if let (Some(uploads), Some(id)) = (&self.uploads, &self.conversation_id) {
            uploads.set_conversation_key(id.clone());
        }
        Session {
            shared: Arc::new(SessionShared {
                state: Mutex::new(SessionState {
                    conversation_id: self.conversation_id,
                    ..Default::default()
                }),
                transport: self.transport,
                drafts: self.drafts.unwrap_or_else(DraftStore::in_memory),
                uploads: self.uploads,
                conversations,
                on_conversation_assigned: self.on_conversation_assigned,
                event_tx,
                idle_notify: Notify::new(),
            }),
        }
    }
}

/// A chat session bound to one conversation
///
/// Cloning shares the same session. State sits behind a mutex that is never
/// held across an await, so `stop()` can be called from anywhere while
/// `send_message` is running.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

/// What one send carries through its lifetime
struct SendContext {
    generation: u64,
    text: String,
    draft_key: String,
    sent_at: i64,
    cancel: CancellationToken,
    meta: ConversationMeta,
    on_finish: Option<FinishCallback>,
    on_error: Option<ErrorCallback>,
}

impl Session {
    pub fn builder(transport: Arc<dyn ChatTransport>) -> SessionBuilder {
        SessionBuilder {
            transport,
            drafts: None,
            uploads: None,
            conversations: None,
            on_conversation_assigned: None,
            conversation_id: None,
        }
    }

    pub fn new(transport: Arc<dyn ChatTransport>) -> Self {
        Self::builder(transport).build()
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Get a cloneable handle for stopping the session from elsewhere
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    pub fn conversation_id(&self) -> Option<String> {
        self.shared.state.lock().conversation_id.clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.shared.state.lock().messages.clone()
    }

    pub fn last_message(&self) -> Option<Message> {
        self.shared.state.lock().messages.last().cloned()
    }

    /// Full artifact, content included, from the latest message that has it
    pub fn artifact(&self, id: &str) -> Option<Artifact> {
        let state = self.shared.state.lock();
        state
            .artifacts
            .iter()
            .filter_map(|(index, bodies)| bodies.get(id).map(|a| (*index, a)))
            .max_by_key(|(index, _)| *index)
            .map(|(_, artifact)| artifact.clone())
    }

    /// Full artifact as produced by the message at `message_index`
    pub fn message_artifact(&self, message_index: usize, id: &str) -> Option<Artifact> {
        let state = self.shared.state.lock();
        state.artifacts.get(&message_index)?.get(id).cloned()
    }

    pub fn drafts(&self) -> &DraftStore {
        &self.shared.drafts
    }

    pub fn uploads(&self) -> Option<&FileUploadCoordinator> {
        self.shared.uploads.as_ref()
    }

    /// Input that failed on the last send, if any
    pub fn last_failed_input(&self) -> Option<String> {
        self.shared.state.lock().last_failed_input.clone()
    }

    fn current_draft_key(&self) -> String {
        draft_key(self.shared.state.lock().conversation_id.as_deref())
    }

    /// Save compose-box content for the current conversation (debounced)
    pub fn update_draft(&self, text: &str) {
        self.shared.drafts.save(&self.current_draft_key(), text);
    }

    pub fn load_draft(&self) -> Option<String> {
        self.shared.drafts.load(&self.current_draft_key())
    }

    /// Stop the outstanding send; no-op when idle
    pub fn stop(&self) -> bool {
        self.shared.stop()
    }

    pub async fn wait_for_idle(&self) {
        self.handle().wait_for_idle().await;
    }

    /// Stop and forget the current conversation
    pub fn new_conversation(&self) {
        self.reset(None, vec![]);
    }

    /// Stop and switch to an existing conversation's history
    pub fn open_conversation(&self, conversation_id: impl Into<String>, messages: Vec<Message>) {
        self.reset(Some(conversation_id.into()), messages);
    }

    fn reset(&self, conversation_id: Option<String>, messages: Vec<Message>) {
        self.shared.stop();
        {
            let mut state = self.shared.state.lock();
            state.conversation_id = conversation_id.clone();
            state.messages = messages;
            state.artifacts.clear();
            state.assistant_index = None;
            state.last_failed_input = None;
        }
        if let Some(uploads) = &self.shared.uploads {
            uploads.clear();
            uploads.set_conversation_key(draft_key(conversation_id.as_deref()));
        }
        tracing::debug!(?conversation_id, "session reset");
        self.shared.emit(SessionEvent::Reset { conversation_id });
    }

    /// Send the last failed input again
    pub async fn retry(&self, options: SendOptions) -> SendOutcome {
        match self.last_failed_input() {
            Some(text) => self.send_message(&text, options).await,
            None => SendOutcome::Ignored,
        }
    }

    /// Send one message and stream the reply into the conversation
    ///
    /// Returns once the reply completes, fails or is stopped. Ignored when the
    /// trimmed input is empty or another send is outstanding.
    pub async fn send_message(&self, input: &str, options: SendOptions) -> SendOutcome {
        let text = input.trim();
        if text.is_empty() {
            return SendOutcome::Ignored;
        }

        let SendOptions {
            web_search,
            agent,
            model,
            on_finish,
            on_error,
        } = options;

        let attachments = self
            .shared
            .uploads
            .as_ref()
            .map(|uploads| uploads.snapshot())
            .unwrap_or_default();
        let attachment_ids: Vec<String> = attachments
            .iter()
            .filter_map(|f| f.uploaded.as_ref().map(|u| u.id.clone()))
            .collect();

        let (request, mut ctx) = {
            let mut state = self.shared.state.lock();
            if state.status.is_busy() {
                tracing::debug!("send ignored, a request is already outstanding");
                return SendOutcome::Ignored;
            }

            let request = ChatStreamRequest {
                message: text.to_string(),
                agent,
                model,
                web_search: Some(web_search),
                conversation_id: state.conversation_id.clone(),
                attachments: attachment_ids,
            };
            if let Err(e) = request.validate() {
                drop(state);
                let error = Error::from(e);
                tracing::debug!("request rejected before sending: {}", error);
                self.shared.emit(SessionEvent::Error {
                    kind: error.kind(),
                    message: error.user_message(),
                });
                let outcome = SendOutcome::Failed {
                    kind: error.kind(),
                    message: error.user_message(),
                };
                if let Some(f) = on_error {
                    f(&error);
                }
                return outcome;
            }

            let cancel = CancellationToken::new();
            state.generation += 1;
            state.status = SessionStatus::Loading;
            state.cancel = Some(cancel.clone());
            state.assistant_index = None;

            let user = Message::user(text, state.conversation_id.clone());
            state.messages.push(user.clone());
            self.shared.emit(SessionEvent::UserMessage { message: user });
            self.shared.emit(SessionEvent::StatusChanged {
                status: SessionStatus::Loading,
            });

            let ctx = SendContext {
                generation: state.generation,
                text: text.to_string(),
                draft_key: draft_key(state.conversation_id.as_deref()),
                sent_at: Utc::now().timestamp_millis(),
                cancel,
                meta: ConversationMeta {
                    conversation_id: state.conversation_id.clone().unwrap_or_default(),
                    ..Default::default()
                },
                on_finish,
                on_error,
            };
            (request, ctx)
        };

        if let Some(uploads) = &self.shared.uploads {
            let sent: Vec<String> = attachments.into_iter().map(|f| f.id).collect();
            uploads.discard(&sent);
        }

        tracing::debug!(
            conversation_id = ?request.conversation_id,
            attachments = request.attachments.len(),
            "sending message"
        );

        let mut stream = match self
            .shared
            .transport
            .open(request, ctx.cancel.clone())
            .await
        {
            Ok(stream) => stream,
            Err(e) => return self.fail(&mut ctx, Error::from(e)),
        };

        let mut assembler = MessageAssembler::new();

        loop {
            let item = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return SendOutcome::Stopped,
                item = stream.next() => item,
            };

            let Some(item) = item else {
                // Clean end without a finish event counts as completed
                return self.complete(&mut ctx);
            };

            let step = match item {
                Ok(event) => Step::from(event),
                Err(e) => return self.fail(&mut ctx, Error::from(e)),
            };

            match step {
                Step::Failed(message) => return self.fail(&mut ctx, Error::Backend(message)),
                Step::Conversation(meta) => {
                    if !self.apply_conversation(&mut ctx, meta) {
                        return SendOutcome::Stopped;
                    }
                }
                Step::Op(op) => {
                    let applied = {
                        let mut state = self.shared.state.lock();
                        if state.generation != ctx.generation {
                            return SendOutcome::Stopped;
                        }
                        self.ensure_assistant(&mut state, &ctx);

                        let SessionState {
                            messages,
                            artifacts,
                            assistant_index,
                            ..
                        } = &mut *state;
                        let Some(message_index) = *assistant_index else {
                            return SendOutcome::Stopped;
                        };
                        let Some(message) = messages.get_mut(message_index) else {
                            return SendOutcome::Stopped;
                        };
                        let bodies = artifacts.entry(message_index).or_default();

                        match assembler.apply(op, &mut message.parts, bodies) {
                            Ok(Applied::Part(index)) => {
                                message.touch();
                                let part = message.parts[index].clone();
                                self.shared.emit(SessionEvent::PartUpdated { index, part });
                                Ok(None)
                            }
                            Ok(Applied::Finalized(status)) => Ok(Some(status)),
                            Err(e) => Err(e),
                        }
                    };

                    match applied {
                        Ok(None) => {}
                        Ok(Some(FinishStatus::Completed)) => return self.complete(&mut ctx),
                        Ok(Some(FinishStatus::Error)) => {
                            return self.fail(
                                &mut ctx,
                                Error::Backend("the backend could not finish the reply".into()),
                            );
                        }
                        Err(e) => return self.fail(&mut ctx, e),
                    }
                }
            }
        }
    }

    /// Create the assistant message on the first event of a send
    fn ensure_assistant(&self, state: &mut SessionState, ctx: &SendContext) {
        if state.assistant_index.is_some() {
            return;
        }
        let mut message = Message::assistant_in_progress(state.conversation_id.clone());
        message.conversation_title = ctx.meta.title.clone();
        message.message_id = ctx.meta.message_id.clone();
        message.response_id = ctx.meta.response_id.clone();
        state.messages.push(message.clone());
        state.assistant_index = Some(state.messages.len() - 1);
        state.status = SessionStatus::Streaming;
        self.shared.emit(SessionEvent::StatusChanged {
            status: SessionStatus::Streaming,
        });
        self.shared.emit(SessionEvent::AssistantStart { message });
    }

    /// Record conversation identity; returns `false` if the send was stopped
    fn apply_conversation(&self, ctx: &mut SendContext, meta: ConversationMeta) -> bool {
        let assigned = {
            let mut state = self.shared.state.lock();
            if state.generation != ctx.generation {
                return false;
            }

            let assigned = match state.conversation_id.clone() {
                None if !meta.conversation_id.is_empty() => {
                    state.conversation_id = Some(meta.conversation_id.clone());
                    Some(meta.conversation_id.clone())
                }
                Some(existing) if existing != meta.conversation_id => {
                    tracing::warn!(
                        current = %existing,
                        received = %meta.conversation_id,
                        "Ignoring conversation id change mid-session"
                    );
                    None
                }
                _ => None,
            };

            if meta.title.is_some() {
                ctx.meta.title = meta.title;
            }
            if meta.message_id.is_some() {
                ctx.meta.message_id = meta.message_id;
            }
            if meta.response_id.is_some() {
                ctx.meta.response_id = meta.response_id;
            }
            if let Some(id) = &state.conversation_id {
                ctx.meta.conversation_id = id.clone();
            }

            self.ensure_assistant(&mut state, ctx);
            let conversation_id = state.conversation_id.clone();
            if let Some(message) = state.assistant_mut() {
                message.conversation_id = conversation_id;
                message.conversation_title = ctx.meta.title.clone();
                message.message_id = ctx.meta.message_id.clone();
                message.response_id = ctx.meta.response_id.clone();
            }
            if let Some(id) = &assigned {
                for message in state.messages.iter_mut() {
                    if message.conversation_id.is_none() {
                        message.conversation_id = Some(id.clone());
                    }
                }
                self.shared.emit(SessionEvent::ConversationAssigned {
                    conversation_id: id.clone(),
                });
            }
            assigned
        };

        if let Some(id) = assigned {
            tracing::debug!(conversation_id = %id, "conversation assigned");
            if let Some(uploads) = &self.shared.uploads {
                uploads.set_conversation_key(id.clone());
            }
            if let Some(hook) = &self.shared.on_conversation_assigned {
                hook(&id);
            }
        }
        true
    }

    fn complete(&self, ctx: &mut SendContext) -> SendOutcome {
        let (message, item) = {
            let mut state = self.shared.state.lock();
            if state.generation != ctx.generation {
                return SendOutcome::Stopped;
            }
            self.ensure_assistant(&mut state, ctx);

            let conversation_id = state.conversation_id.clone();
            let Some(message) = state.assistant_mut() else {
                return SendOutcome::Stopped;
            };
            message.status = MessageStatus::Completed;
            message.touch();
            let message = message.clone();

            state.status = SessionStatus::Idle;
            state.cancel = None;
            state.assistant_index = None;
            state.last_failed_input = None;

            self.shared.emit(SessionEvent::AssistantEnd {
                message: message.clone(),
            });
            self.shared.emit(SessionEvent::StatusChanged {
                status: SessionStatus::Idle,
            });

            let now = Utc::now();
            let item = conversation_id.map(|id| ConversationItem {
                id,
                title: ctx
                    .meta
                    .title
                    .clone()
                    .filter(|t| !t.trim().is_empty())
                    .unwrap_or_else(|| ctx.text.clone()),
                created_at: now,
                updated_at: now,
            });
            (message, item)
        };

        match item {
            Some(item) => self.shared.conversations.upsert(item),
            None => tracing::warn!("Reply finished without a conversation id, list not updated"),
        }
        self.shared.drafts.clear_stale(&ctx.draft_key, ctx.sent_at);
        tracing::debug!(parts = message.parts.len(), "reply completed");

        if let Some(f) = ctx.on_finish.take() {
            f(&message);
        }
        self.shared.idle_notify.notify_waiters();
        SendOutcome::Completed(message)
    }

    fn fail(&self, ctx: &mut SendContext, error: Error) -> SendOutcome {
        {
            let mut state = self.shared.state.lock();
            if state.generation != ctx.generation || ctx.cancel.is_cancelled() {
                return SendOutcome::Stopped;
            }

            if let Some(message) = state.assistant_mut() {
                message.status = MessageStatus::Error;
                message
                    .metadata
                    .get_or_insert_with(JsonMap::new)
                    .insert("error".into(), error.to_string().into());
                message.touch();
                let message = message.clone();
                self.shared.emit(SessionEvent::AssistantEnd { message });
            }

            state.status = SessionStatus::Idle;
            state.cancel = None;
            state.assistant_index = None;
            state.last_failed_input = Some(ctx.text.clone());

            self.shared.emit(SessionEvent::Error {
                kind: error.kind(),
                message: error.user_message(),
            });
            self.shared.emit(SessionEvent::StatusChanged {
                status: SessionStatus::Idle,
            });
        }

        tracing::warn!(kind = ?error.kind(), "Send failed: {}", error);
        let outcome = SendOutcome::Failed {
            kind: error.kind(),
            message: error.user_message(),
        };
        if let Some(f) = ctx.on_error.take() {
            f(&error);
        }
        self.shared.idle_notify.notify_waiters();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation_cache::InMemoryConversationList;
    use crate::upload::{AttachedFile, FileUploader, UploadPolicy};
    use async_trait::async_trait;
    use parley_api::{
        ArtifactKind, ArtifactStatus, MessagePart, Role, StreamEvent, StreamEventStream,
        ToolCallStatus, UploadedFile,
    };
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    type EventResult = parley_api::Result<StreamEvent>;

    enum Script {
        Events(Vec<EventResult>),
        Channel(mpsc::UnboundedReceiver<EventResult>),
        OpenError(parley_api::Error),
    }

    /// Transport that replays one script per `open` call.
    #[derive(Default)]
    struct ScriptedTransport {
        scripts: Mutex<VecDeque<Script>>,
        requests: Mutex<Vec<ChatStreamRequest>>,
    }

    impl ScriptedTransport {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                requests: Mutex::new(vec![]),
            })
        }

        fn requests(&self) -> Vec<ChatStreamRequest> {
            self.requests.lock().clone()
        }
    }

    #[async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn open(
            &self,
            request: ChatStreamRequest,
            _cancel: CancellationToken,
        ) -> parley_api::Result<StreamEventStream> {
            self.requests.lock().push(request);
            let script = self
                .scripts
                .lock()
                .pop_front()
                .unwrap_or(Script::Events(vec![]));

            match script {
                Script::Events(events) => Ok(Box::pin(async_stream::stream! {
                    for event in events {
                        yield event;
                    }
                })),
                Script::Channel(mut rx) => Ok(Box::pin(async_stream::stream! {
                    while let Some(event) = rx.recv().await {
                        yield event;
                    }
                })),
                Script::OpenError(e) => Err(e),
            }
        }
    }

    fn text(content: &str) -> EventResult {
        Ok(StreamEvent::Text {
            content: content.into(),
        })
    }

    fn finish() -> EventResult {
        Ok(StreamEvent::Finish {
            status: FinishStatus::Completed,
        })
    }

    fn conversation(id: &str, title: Option<&str>) -> EventResult {
        Ok(StreamEvent::Conversation {
            conversation_id: id.into(),
            title: title.map(String::from),
            message_id: None,
            response_id: None,
        })
    }

    #[derive(Default)]
    struct Calls {
        finished: AtomicUsize,
        errored: AtomicUsize,
    }

    fn counted_options(calls: &Arc<Calls>) -> SendOptions {
        let on_finish = Arc::clone(calls);
        let on_error = Arc::clone(calls);
        SendOptions::new()
            .on_finish(move |_| {
                on_finish.finished.fetch_add(1, Ordering::SeqCst);
            })
            .on_error(move |_| {
                on_error.errored.fetch_add(1, Ordering::SeqCst);
            })
    }

    fn recording_cache() -> (Arc<dyn ConversationListCache>, Arc<Mutex<Vec<ConversationItem>>>) {
        let seen = Arc::new(Mutex::new(vec![]));
        let sink = Arc::clone(&seen);
        let cache: Arc<dyn ConversationListCache> =
            Arc::new(move |item: ConversationItem| sink.lock().push(item));
        (cache, seen)
    }

    async fn wait_for(
        rx: &mut broadcast::Receiver<SessionEvent>,
        pred: impl Fn(&SessionEvent) -> bool,
    ) {
        loop {
            let event = rx.recv().await.expect("session event");
            if pred(&event) {
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_balance_sheet_reply() {
        let transport = ScriptedTransport::new(vec![Script::Events(vec![
            conversation("c-1", None),
            text("Here is"),
            text(" your balance sheet"),
            finish(),
        ])]);
        let (cache, upserts) = recording_cache();
        let assigned = Arc::new(Mutex::new(vec![]));
        let assigned_sink = Arc::clone(&assigned);
        let session = Session::builder(transport.clone())
            .conversations(cache)
            .on_conversation_assigned(move |id| assigned_sink.lock().push(id.to_string()))
            .build();

        session.update_draft("Generate a balance sheet");
        session.drafts().flush();
        assert!(session.load_draft().is_some());

        let calls = Arc::new(Calls::default());
        let outcome = session
            .send_message(
                "Generate a balance sheet",
                counted_options(&calls).model("gpt-4-turbo").web_search(false),
            )
            .await;

        let SendOutcome::Completed(reply) = outcome else {
            panic!("expected completion, got {:?}", outcome);
        };
        assert_eq!(reply.role, Role::Assistant);
        assert_eq!(reply.status, MessageStatus::Completed);
        assert_eq!(
            reply.parts,
            vec![
                MessagePart::text("Here is"),
                MessagePart::text(" your balance sheet")
            ]
        );

        let upserts = upserts.lock();
        assert_eq!(upserts.len(), 1);
        assert_eq!(upserts[0].id, "c-1");
        assert_eq!(upserts[0].title, "Generate a balance sheet");

        assert_eq!(calls.finished.load(Ordering::SeqCst), 1);
        assert_eq!(calls.errored.load(Ordering::SeqCst), 0);
        assert_eq!(*assigned.lock(), vec!["c-1".to_string()]);
        assert_eq!(session.conversation_id().as_deref(), Some("c-1"));
        assert_eq!(session.status(), SessionStatus::Idle);
        assert_eq!(session.messages().len(), 2);
        assert_eq!(session.drafts().load("new_chat"), None);

        let request = &transport.requests()[0];
        assert_eq!(request.message, "Generate a balance sheet");
        assert_eq!(request.model.as_deref(), Some("gpt-4-turbo"));
        assert_eq!(request.agent, None);
        assert_eq!(request.web_search, Some(false));
        assert_eq!(request.conversation_id, None);
    }

    #[tokio::test]
    async fn test_server_title_used_and_id_reused() {
        let transport = ScriptedTransport::new(vec![
            Script::Events(vec![conversation("c-9", Some("Balance sheet")), text("ok"), finish()]),
            Script::Events(vec![conversation("c-9", None), text("again"), finish()]),
        ]);
        let list = Arc::new(InMemoryConversationList::new());
        let session = Session::builder(transport.clone())
            .conversations(list.clone())
            .build();

        session.send_message("make it", SendOptions::new()).await;
        assert_eq!(list.get("c-9").unwrap().title, "Balance sheet");
        assert_eq!(
            session.messages()[1].conversation_title.as_deref(),
            Some("Balance sheet")
        );

        session.send_message("and again", SendOptions::new()).await;
        assert_eq!(list.len(), 1);
        assert_eq!(transport.requests()[1].conversation_id.as_deref(), Some("c-9"));
        assert!(session.messages().iter().all(|m| m.conversation_id.as_deref() == Some("c-9")));
    }

    #[tokio::test]
    async fn test_tool_call_updated_in_place() {
        let mut args = JsonMap::new();
        args.insert("result".into(), "ok".into());
        let transport = ScriptedTransport::new(vec![Script::Events(vec![
            Ok(StreamEvent::ToolCallStart {
                id: "t1".into(),
                name: "lookup".into(),
            }),
            Ok(StreamEvent::ToolCallUpdate {
                id: "t1".into(),
                status: ToolCallStatus::InProgress,
                arguments: None,
            }),
            Ok(StreamEvent::ToolCallUpdate {
                id: "t1".into(),
                status: ToolCallStatus::Completed,
                arguments: Some(args.clone()),
            }),
            finish(),
        ])]);
        let session = Session::new(transport);

        let SendOutcome::Completed(reply) = session.send_message("look it up", SendOptions::new()).await
        else {
            panic!("expected completion");
        };
        assert_eq!(reply.parts.len(), 1);
        let tool_call = reply.tool_call("t1").unwrap();
        assert_eq!(tool_call.name, "lookup");
        assert_eq!(tool_call.status, ToolCallStatus::Completed);
        assert_eq!(tool_call.arguments, Some(args));
    }

    #[tokio::test]
    async fn test_artifact_body_kept_by_session() {
        let transport = ScriptedTransport::new(vec![Script::Events(vec![
            Ok(StreamEvent::ArtifactStart {
                id: "a1".into(),
                kind: ArtifactKind::Code,
                title: "sheet.py".into(),
                language: "python".into(),
            }),
            Ok(StreamEvent::ArtifactUpdate {
                id: "a1".into(),
                status: ArtifactStatus::InProgress,
                content_delta: Some("print(".into()),
            }),
            Ok(StreamEvent::ArtifactUpdate {
                id: "a1".into(),
                status: ArtifactStatus::Completed,
                content_delta: Some("1)".into()),
            }),
            finish(),
        ])]);
        let session = Session::new(transport);
        session.send_message("code please", SendOptions::new()).await;

        let artifact = session.artifact("a1").unwrap();
        assert_eq!(artifact.content, "print(1)");
        assert_eq!(artifact.summary.status, ArtifactStatus::Completed);
        let reply = session.last_message().unwrap();
        assert_eq!(reply.artifact("a1").unwrap().status, ArtifactStatus::Completed);
    }

    #[tokio::test]
    async fn test_reused_artifact_id_keeps_each_reply_body() {
        let code = |content: &str| {
            vec![
                Ok(StreamEvent::ArtifactStart {
                    id: "a1".into(),
                    kind: ArtifactKind::Code,
                    title: "sheet.py".into(),
                    language: "python".into(),
                }),
                Ok(StreamEvent::ArtifactUpdate {
                    id: "a1".into(),
                    status: ArtifactStatus::Completed,
                    content_delta: Some(content.into()),
                }),
                finish(),
            ]
        };
        let transport = ScriptedTransport::new(vec![
            Script::Events(code("print(1)")),
            Script::Events(code("print(2)")),
        ]);
        let session = Session::new(transport);
        session.send_message("first", SendOptions::new()).await;
        session.send_message("second", SendOptions::new()).await;

        assert_eq!(session.message_artifact(1, "a1").unwrap().content, "print(1)");
        assert_eq!(session.message_artifact(3, "a1").unwrap().content, "print(2)");
        assert_eq!(session.artifact("a1").unwrap().content, "print(2)");
        assert!(session.message_artifact(0, "a1").is_none());

        session.new_conversation();
        assert!(session.artifact("a1").is_none());
    }

    #[tokio::test]
    async fn test_unusual_server_id_is_sent_back() {
        let transport = ScriptedTransport::new(vec![
            Script::Events(vec![conversation("conv/2024 01", None), text("ok"), finish()]),
            Script::Events(vec![text("again"), finish()]),
        ]);
        let session = Session::new(transport.clone());

        session.send_message("first", SendOptions::new()).await;
        assert_eq!(session.conversation_id().as_deref(), Some("conv/2024 01"));

        let outcome = session.send_message("second", SendOptions::new()).await;
        assert!(matches!(outcome, SendOutcome::Completed(_)));
        assert_eq!(
            transport.requests()[1].conversation_id.as_deref(),
            Some("conv/2024 01")
        );
        assert_eq!(session.messages().len(), 4);
    }

    #[tokio::test]
    async fn test_mid_stream_transport_failure() {
        let transport = ScriptedTransport::new(vec![Script::Events(vec![
            text("Assets"),
            text(" and liabilities"),
            Err(parley_api::Error::Sse("connection reset".into())),
        ])]);
        let (cache, upserts) = recording_cache();
        let session = Session::builder(transport).conversations(cache).build();
        let mut events = session.subscribe();

        let calls = Arc::new(Calls::default());
        let outcome = session
            .send_message("Generate a balance sheet", counted_options(&calls))
            .await;

        assert!(matches!(
            outcome,
            SendOutcome::Failed {
                kind: ErrorKind::Transport,
                ..
            }
        ));
        let reply = session.last_message().unwrap();
        assert_eq!(reply.status, MessageStatus::Error);
        assert_eq!(reply.parts.len(), 2);
        assert_eq!(reply.text(), "Assets and liabilities");
        assert_eq!(calls.errored.load(Ordering::SeqCst), 1);
        assert_eq!(calls.finished.load(Ordering::SeqCst), 0);
        assert!(upserts.lock().is_empty());
        assert_eq!(session.status(), SessionStatus::Idle);
        assert_eq!(
            session.last_failed_input().as_deref(),
            Some("Generate a balance sheet")
        );

        let mut errors = 0;
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::Error { message, .. } = event {
                assert_eq!(message, "Something went wrong, please try again.");
                errors += 1;
            }
        }
        assert_eq!(errors, 1);
    }

    #[tokio::test]
    async fn test_open_failure_leaves_no_assistant_message() {
        let transport = ScriptedTransport::new(vec![Script::OpenError(parley_api::Error::api(
            503,
            "overloaded",
        ))]);
        let session = Session::new(transport);
        let calls = Arc::new(Calls::default());

        let outcome = session.send_message("hello", counted_options(&calls)).await;
        assert!(matches!(outcome, SendOutcome::Failed { .. }));
        let messages = session.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(calls.errored.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_backend_error_then_manual_retry() {
        let transport = ScriptedTransport::new(vec![
            Script::Events(vec![text("partial"), Ok(StreamEvent::Error {
                message: "model overloaded".into(),
            })]),
            Script::Events(vec![text("done"), finish()]),
        ]);
        let session = Session::new(transport.clone());

        let outcome = session.send_message("try this", SendOptions::new()).await;
        assert!(matches!(
            outcome,
            SendOutcome::Failed {
                kind: ErrorKind::Transport,
                ..
            }
        ));

        let outcome = session.retry(SendOptions::new()).await;
        assert!(matches!(outcome, SendOutcome::Completed(_)));
        assert_eq!(transport.requests()[1].message, "try this");
        assert!(session.last_failed_input().is_none());
        assert_eq!(session.retry(SendOptions::new()).await, SendOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_finish_with_error_status_fails() {
        let transport = ScriptedTransport::new(vec![Script::Events(vec![
            text("half"),
            Ok(StreamEvent::Finish {
                status: FinishStatus::Error,
            }),
        ])]);
        let session = Session::new(transport);
        let outcome = session.send_message("go", SendOptions::new()).await;
        assert!(matches!(outcome, SendOutcome::Failed { .. }));
        assert_eq!(session.last_message().unwrap().status, MessageStatus::Error);
    }

    #[tokio::test]
    async fn test_clean_end_without_finish_completes() {
        let transport = ScriptedTransport::new(vec![Script::Events(vec![text("short")])]);
        let session = Session::new(transport);
        let outcome = session.send_message("go", SendOptions::new()).await;
        let SendOutcome::Completed(reply) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(reply.text(), "short");
    }

    #[tokio::test]
    async fn test_unknown_id_is_protocol_error_and_session_recovers() {
        let transport = ScriptedTransport::new(vec![
            Script::Events(vec![
                text("before"),
                Ok(StreamEvent::ToolCallUpdate {
                    id: "ghost".into(),
                    status: ToolCallStatus::Completed,
                    arguments: None,
                }),
                text("never applied"),
            ]),
            Script::Events(vec![text("fine"), finish()]),
        ]);
        let session = Session::new(transport);
        let calls = Arc::new(Calls::default());

        let outcome = session.send_message("first", counted_options(&calls)).await;
        assert!(matches!(
            outcome,
            SendOutcome::Failed {
                kind: ErrorKind::Protocol,
                ..
            }
        ));
        let failed = session.last_message().unwrap();
        assert_eq!(failed.status, MessageStatus::Error);
        assert_eq!(failed.parts, vec![MessagePart::text("before")]);
        assert_eq!(calls.errored.load(Ordering::SeqCst), 1);

        let outcome = session.send_message("second", SendOptions::new()).await;
        assert!(matches!(outcome, SendOutcome::Completed(_)));
        assert_eq!(session.messages().len(), 4);
    }

    #[tokio::test]
    async fn test_invalid_request_is_not_sent() {
        let transport = ScriptedTransport::new(vec![]);
        let session = Session::new(transport.clone());
        let calls = Arc::new(Calls::default());
        let too_long = "x".repeat(parley_api::request::MAX_MESSAGE_CHARS + 1);

        let outcome = session.send_message(&too_long, counted_options(&calls)).await;
        assert!(matches!(
            outcome,
            SendOutcome::Failed {
                kind: ErrorKind::Validation,
                ..
            }
        ));
        assert!(session.messages().is_empty());
        assert!(transport.requests().is_empty());
        assert_eq!(session.status(), SessionStatus::Idle);
        assert_eq!(calls.errored.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_input_ignored() {
        let transport = ScriptedTransport::new(vec![]);
        let session = Session::new(transport.clone());
        assert_eq!(
            session.send_message("   \n", SendOptions::new()).await,
            SendOutcome::Ignored
        );
        assert!(session.messages().is_empty());
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_send_while_busy_is_noop() {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = ScriptedTransport::new(vec![Script::Channel(rx)]);
        let session = Session::new(transport.clone());
        let mut events = session.subscribe();

        let first = tokio::spawn({
            let session = session.clone();
            async move { session.send_message("first", SendOptions::new()).await }
        });
        wait_for(&mut events, |e| matches!(e, SessionEvent::UserMessage { .. })).await;
        assert_eq!(session.status(), SessionStatus::Loading);

        let outcome = session.send_message("second", SendOptions::new()).await;
        assert_eq!(outcome, SendOutcome::Ignored);
        assert_eq!(session.messages().len(), 1);

        tx.send(text("streaming")).unwrap();
        wait_for(&mut events, |e| matches!(e, SessionEvent::PartUpdated { .. })).await;
        assert_eq!(session.status(), SessionStatus::Streaming);
        assert_eq!(
            session.send_message("third", SendOptions::new()).await,
            SendOutcome::Ignored
        );

        tx.send(finish()).unwrap();
        assert!(matches!(first.await.unwrap(), SendOutcome::Completed(_)));
        assert_eq!(transport.requests().len(), 1);
        assert_eq!(session.messages().len(), 2);
    }

    #[tokio::test]
    async fn test_stop_while_idle_changes_nothing() {
        let transport = ScriptedTransport::new(vec![Script::Events(vec![text("hi"), finish()])]);
        let session = Session::new(transport);
        session.send_message("hello", SendOptions::new()).await;
        let before = session.messages();
        let mut events = session.subscribe();

        assert!(!session.stop());
        assert!(!session.handle().stop());
        assert_eq!(session.messages(), before);
        assert_eq!(session.status(), SessionStatus::Idle);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_while_streaming_freezes_message() {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = ScriptedTransport::new(vec![Script::Channel(rx)]);
        let session = Session::new(transport);
        let handle = session.handle();
        let mut events = session.subscribe();
        let calls = Arc::new(Calls::default());

        let send = tokio::spawn({
            let session = session.clone();
            let options = counted_options(&calls);
            async move { session.send_message("write a report", options).await }
        });

        tx.send(text("Quarterly")).unwrap();
        wait_for(&mut events, |e| matches!(e, SessionEvent::PartUpdated { .. })).await;

        assert!(handle.stop());
        assert!(!handle.stop());
        assert_eq!(handle.status(), SessionStatus::Idle);

        let _ = tx.send(text(" results"));
        let _ = tx.send(finish());
        assert_eq!(send.await.unwrap(), SendOutcome::Stopped);

        let reply = session.last_message().unwrap();
        assert_eq!(reply.status, MessageStatus::Error);
        assert_eq!(reply.parts, vec![MessagePart::text("Quarterly")]);
        assert_eq!(
            reply.metadata.unwrap()["finish_reason"],
            serde_json::json!("cancelled")
        );
        assert_eq!(calls.finished.load(Ordering::SeqCst), 0);
        assert_eq!(calls.errored.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stop_while_loading_creates_no_assistant_message() {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = ScriptedTransport::new(vec![Script::Channel(rx)]);
        let session = Session::new(transport);
        let mut events = session.subscribe();

        let send = tokio::spawn({
            let session = session.clone();
            async move { session.send_message("hello", SendOptions::new()).await }
        });
        wait_for(&mut events, |e| {
            matches!(
                e,
                SessionEvent::StatusChanged {
                    status: SessionStatus::Loading
                }
            )
        })
        .await;

        assert!(session.stop());
        let _ = tx.send(text("late"));
        assert_eq!(send.await.unwrap(), SendOutcome::Stopped);

        let messages = session.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_wait_for_idle_after_stop() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let transport = ScriptedTransport::new(vec![Script::Channel(rx)]);
        let session = Session::new(transport);
        let handle = session.handle();
        let mut events = session.subscribe();

        let send = tokio::spawn({
            let session = session.clone();
            async move { session.send_message("hello", SendOptions::new()).await }
        });
        wait_for(&mut events, |e| matches!(e, SessionEvent::UserMessage { .. })).await;

        let waiter = tokio::spawn({
            let handle = handle.clone();
            async move { handle.wait_for_idle().await }
        });
        tokio::task::yield_now().await;
        handle.stop();
        waiter.await.unwrap();
        assert!(handle.wait_for_idle_timeout(std::time::Duration::from_millis(10)).await);
        assert_eq!(send.await.unwrap(), SendOutcome::Stopped);
    }

    #[tokio::test]
    async fn test_new_conversation_resets_state() {
        let transport = ScriptedTransport::new(vec![Script::Events(vec![
            conversation("c-1", None),
            text("hi"),
            finish(),
        ])]);
        let session = Session::new(transport);
        session.send_message("hello", SendOptions::new()).await;
        assert_eq!(session.conversation_id().as_deref(), Some("c-1"));

        let mut events = session.subscribe();
        session.new_conversation();
        assert!(session.messages().is_empty());
        assert!(session.conversation_id().is_none());
        assert!(matches!(
            events.try_recv().unwrap(),
            SessionEvent::Reset {
                conversation_id: None
            }
        ));
    }

    #[tokio::test]
    async fn test_open_conversation_continues_history() {
        let transport = ScriptedTransport::new(vec![Script::Events(vec![text("more"), finish()])]);
        let session = Session::new(transport.clone());
        let history = vec![Message::user("earlier", Some("c-5".into()))];

        session.open_conversation("c-5", history);
        assert_eq!(session.messages().len(), 1);

        session.send_message("continue", SendOptions::new()).await;
        assert_eq!(transport.requests()[0].conversation_id.as_deref(), Some("c-5"));
        assert_eq!(session.messages().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drafts_follow_conversation() {
        let transport = ScriptedTransport::new(vec![]);
        let session = Session::new(transport);

        session.update_draft("unsent idea");
        tokio::time::sleep(std::time::Duration::from_millis(400)).await;
        assert_eq!(session.load_draft().as_deref(), Some("unsent idea"));

        session.open_conversation("c-2", vec![]);
        assert_eq!(session.load_draft(), None);
        session.update_draft("");
        session.new_conversation();
        assert_eq!(session.load_draft().as_deref(), Some("unsent idea"));
    }

    struct InstantUploader;

    #[async_trait]
    impl FileUploader for InstantUploader {
        async fn upload(
            &self,
            file: &AttachedFile,
            _conversation_key: &str,
        ) -> parley_api::Result<UploadedFile> {
            Ok(UploadedFile {
                id: format!("file-{}", file.name),
                url: None,
            })
        }
    }

    #[tokio::test]
    async fn test_ready_attachments_sent_and_discarded() {
        let transport = ScriptedTransport::new(vec![Script::Events(vec![text("got it"), finish()])]);
        let uploads = FileUploadCoordinator::new(Arc::new(InstantUploader), UploadPolicy::default());
        let session = Session::builder(transport.clone())
            .uploads(uploads.clone())
            .build();

        uploads.add_files(vec![
            AttachedFile::from_bytes("q3.csv", b"a,b\n1,2".to_vec()),
            AttachedFile::from_bytes("virus.exe", vec![1u8]),
        ]);
        uploads.wait_settled().await;

        session.send_message("summarize", SendOptions::new()).await;
        assert_eq!(transport.requests()[0].attachments, vec!["file-q3.csv".to_string()]);

        let remaining = uploads.files();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].file.name, "virus.exe");
    }
}
