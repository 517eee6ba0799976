pub mod person;

pub use person::{ConcurrencyValues, Person, PersonValues};
