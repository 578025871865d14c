//! Event System - typed publish/subscribe
//!
//! Each publisher owns an `EventBus<E>` for its own event type. Consumers
//! either register an [`EventListener`] (called in publish order) or take a
//! broadcast receiver for stream-style consumption.
//!
//! ```ignore
//! let bus: EventBus<ServerEvent> = EventBus::new("alice");
//! let id = bus.subscribe(Arc::new(MyListener)).await;
//! bus.publish(ServerEvent::Announcement("hello".into())).await;
//! bus.unsubscribe(id).await;
//! ```

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventBusConfig, EventListener, ListenerId};
pub use types::{EventId, EventRecord};
