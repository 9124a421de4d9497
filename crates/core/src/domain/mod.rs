pub mod delegation;
pub mod request;
pub mod tier;
pub mod workflow;
