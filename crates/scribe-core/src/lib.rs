pub mod ids;
pub mod loaders;
pub mod messages;
pub mod safety;

pub use ids::SessionId;
pub use messages::{Message, MessageRecord, Role};
