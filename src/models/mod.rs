pub mod event;
pub mod profile;

pub use event::{ConnectEvent, Request};
pub use profile::{AddressRecord, UserProfile};
