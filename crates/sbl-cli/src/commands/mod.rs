//! Command implementations

pub mod derive_key;
pub mod flash;
pub mod inspect;
pub mod unlock;

pub use derive_key::derive_key;
pub use flash::flash;
pub use inspect::inspect;
pub use unlock::unlock;
