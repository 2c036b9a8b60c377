pub mod broadcaster;
pub mod gateway;
pub mod messages;

pub use broadcaster::{Broadcaster, DeliveryReport, GroupKey, Subscription};
pub use gateway::{CloseReason, Connection, ConnectionState, Gateway};
pub use messages::{ClientMessage, ProtocolError, ServerMessage, SyncAction};
