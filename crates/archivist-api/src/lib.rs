pub mod error;
pub mod gateway;
pub mod handlers;
pub mod router;
pub mod signer;

pub use error::ApiError;
pub use gateway::{ArchiveGateway, CreateOutcome, Retrieval};
pub use router::{AppState, archive_router};
pub use signer::{LinkSigner, LinkSignerConfig, SignedLink};
