pub mod broker;
pub mod event;
pub mod feed;

pub use broker::{create_change_feed, AmqpChangeFeed};
pub use event::{ChangeEvent, ChangeKind};
pub use feed::{ChangeCallback, ChangeFeed, LocalChangeFeed, SubscriptionId};
