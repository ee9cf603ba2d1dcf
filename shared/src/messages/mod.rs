pub mod auth;
pub mod downstream;
pub mod upstream;
