pub mod pubsub;

pub use pubsub::{Bus, Subscription};
