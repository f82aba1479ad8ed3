pub mod client;
pub mod soap;
