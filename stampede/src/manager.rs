//! The manager: attack service, per-node controllers, the stream listener
//! workers connect to and the REST surface clients talk to.

pub mod api;
pub mod node;
pub mod service;
pub mod stream;
