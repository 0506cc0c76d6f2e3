// Agora common library - main library exports

pub mod collaborators;
pub mod crypto;
pub mod errors;
pub mod hash;
pub mod messages;
pub mod peer;
pub mod types;

// Flattened re-exports
pub use self::errors::ChainError;
pub use self::hash::*;
pub use self::types::*;
