//! Stream bridge - conversions between the transport's push dialect and `futures::Stream`
//!
//! Transports produce [`Publisher`]s: cold, single-subscription producers that
//! push items through a bounded channel. Selection, retry and callers work with
//! pull-based `futures::Stream`s. [`into_stream`] and [`into_publisher`] are the
//! only crossing points between the two, and both preserve item order, error
//! values and cancellation.

pub mod adapter;
pub mod publisher;
pub mod switch;

pub use adapter::{into_publisher, into_stream, PublisherStream};
pub use publisher::{Emitter, Publisher, Subscription};
pub use switch::SwitchMap;
