//! # Event Bus Module
//!
//! Typed publish/subscribe for everything a printer link reports: state
//! transitions, queue events, printer signals and transport events.
//!
//! ## Usage
//!
//! ```rust
//! use printlink_core::event_bus::{EventBus, EventCategory, EventFilter, LinkEvent, QueueEvent};
//!
//! let bus = EventBus::new();
//! let subscription = bus.subscribe(
//!     EventFilter::Categories(vec![EventCategory::Queue]),
//!     |event| {
//!         if let LinkEvent::Queue(queue) = event {
//!             println!("Queue event: {:?}", queue);
//!         }
//!     },
//! );
//!
//! bus.publish(LinkEvent::Queue(QueueEvent::LineNumberChanged { line_number: 0 }))
//!     .ok();
//! bus.unsubscribe(subscription);
//! ```

mod bus;
mod events;

pub use bus::*;
pub use events::*;
