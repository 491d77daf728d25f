//! parley-session: streaming chat session engine
//!
//! This crate turns a backend event stream into an ordered assistant message,
//! gates sends so only one request is outstanding per session, and carries the
//! pieces around it: debounced drafts, concurrent attachment uploads, the
//! conversation list cache and the model catalog.

pub mod assembler;
pub mod catalog;
pub mod conversation_cache;
pub mod draft;
pub mod error;
pub mod events;
pub mod handle;
pub mod session;
pub mod transport;
pub mod upload;

pub use assembler::{MessageAssembler, PartOp};
pub use catalog::{ModelCatalog, ModelSource};
pub use conversation_cache::{ConversationListCache, InMemoryConversationList};
pub use draft::{DraftBackend, DraftStore, FileDraftBackend, MemoryDraftBackend, draft_key};
pub use error::{Error, ErrorKind, Result};
pub use events::{SessionEvent, SessionStatus};
pub use handle::SessionHandle;
pub use session::{SendOptions, SendOutcome, Session, SessionBuilder};
pub use transport::ChatTransport;
pub use upload::{
    AttachedFile, FileStatus, FileUploadCoordinator, FileUploader, FileWithStatus, UploadEvent,
    UploadPolicy, UploadRejection,
};
