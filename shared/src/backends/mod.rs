pub mod clock;
pub mod rand;
pub mod timer;
