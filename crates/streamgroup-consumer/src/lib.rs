//! Consumer groups over keyed streams.
//!
//! [`MessageConsumer`] joins groups identified by a subscriber id. Within a group, the partitions
//! of the subscribed channels are spread across the live consumers by an elected leader, and each
//! consumer runs one consumption loop per partition it owns. Delivery is in stream order per
//! partition and at-least-once across rebalances.

mod config;
mod consumer;
mod error;
mod handler;
mod partition_loop;
mod subscription;

pub use config::ConsumerConfig;
pub use config::SubscriptionIdGenerator;
pub use consumer::MessageConsumer;
pub use error::ConsumerError;
pub use handler::DecoratedMessageHandlerFactory;
pub use handler::FnHandler;
pub use handler::Message;
pub use handler::MessageHandler;
pub use handler::PassthroughDecorator;
pub use handler::RetryingHandlerDecorator;
pub use handler::handler_fn;
pub use subscription::Subscription;
