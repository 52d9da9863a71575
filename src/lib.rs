// ABOUTME: Library crate for office-bridge exposing the pool, supervisor and transports

#![allow(missing_docs)]

pub mod bridge;
