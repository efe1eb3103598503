#![forbid(unsafe_code)]

pub mod connection;
pub mod conversations;
pub mod health;
pub mod identity;
pub mod moderation;
pub mod presence;
pub mod rate_limit;
pub mod router;
pub mod session_cache;
pub mod store;

#[cfg(test)]
mod conversations_tests;

#[cfg(test)]
mod presence_tests;

#[cfg(test)]
mod rate_limit_tests;
