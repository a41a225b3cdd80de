pub mod local;
pub mod memory;
pub mod queue;
pub mod repository;

pub use local::LocalObjectStorage;
pub use memory::InMemoryVectorStore;
pub use queue::{DeadLetter, InMemoryJobQueue};
pub use repository::InMemoryDocumentRepository;
