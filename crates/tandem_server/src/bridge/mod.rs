#![forbid(unsafe_code)]

pub mod activity;
pub mod http;
pub mod orchestrator;
pub mod portal;
pub mod puppet;
pub mod registry;
pub mod session;
pub mod supervisor;
pub mod user;

#[cfg(test)]
mod test_support;

#[cfg(test)]
mod activity_tests;
#[cfg(test)]
mod session_tests;
