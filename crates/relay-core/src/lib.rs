pub mod bus;
pub mod id;

pub use bus::{define_event, Bus, BusEvent, BusEventDef};
