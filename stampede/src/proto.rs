//! Wire message structs for the node-manager stream.
//!
//! These mirror `proto/stampede/v1/attack.proto` and are committed rather
//! than generated at build time so the crate carries no protoc dependency.
//! The on-wire format is subject to change with no backward compatibility
//! guarantees. Do not mix versions of this crate.
#![allow(clippy::pedantic)]

/// A scenario advertised by a node during handshake.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Scenario {
    /// The name of the scenario, unique per node.
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    /// A human-readable description of the scenario.
    #[prost(string, tag = "2")]
    pub description: ::prost::alloc::string::String,
}
/// The first message on a new stream, declaring a node's name and advertised
/// scenarios.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Handshake {
    /// The node's self-declared identifier.
    #[prost(string, tag = "1")]
    pub node_name: ::prost::alloc::string::String,
    /// The scenarios this node can run.
    #[prost(message, repeated, tag = "2")]
    pub scenarios: ::prost::alloc::vec::Vec<Scenario>,
}
/// Acknowledgement of a received server message.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Acknowledge {}
/// A client-to-server message.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AttackRequest {
    /// The payload of this request.
    #[prost(oneof = "attack_request::Request", tags = "1, 2")]
    pub request: ::core::option::Option<attack_request::Request>,
}
/// Nested message and enum types in `AttackRequest`.
pub mod attack_request {
    /// The payload of a client-to-server message.
    #[allow(clippy::derive_partial_eq_without_eq)]
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Request {
        /// Sent exactly once, as the first message on the stream.
        #[prost(message, tag = "1")]
        Handshake(super::Handshake),
        /// Reply to any received server message.
        #[prost(message, tag = "2")]
        Acknowledge(super::Acknowledge),
    }
}
/// Command to start an increment on a worker.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OperationStart {
    /// Globally-unique token used to detect exact-duplicate re-deliveries.
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    /// The attack to start.
    #[prost(int64, tag = "2")]
    pub attack_id: i64,
    /// The increment to start.
    #[prost(int64, tag = "3")]
    pub increment_id: i64,
    /// The pacing window in seconds.
    #[prost(float, tag = "4")]
    pub wait_time_sec: f32,
    /// Scenario name to user count, this node's slice only.
    #[prost(map = "string, int64", tag = "5")]
    pub scenarios: ::std::collections::HashMap<::prost::alloc::string::String, i64>,
}
/// Command to stop an attack or a single increment on a worker.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OperationStop {
    /// The attack to stop.
    #[prost(int64, tag = "1")]
    pub attack_id: i64,
    /// The increment to stop. Absent stops the whole attack.
    #[prost(int64, optional, tag = "2")]
    pub increment_id: ::core::option::Option<i64>,
}
/// Command instructing the worker to terminate the stream.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OperationKill {}
/// A server-to-client message.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AttackResponse {
    /// The payload of this response.
    #[prost(oneof = "attack_response::Response", tags = "1, 2, 3")]
    pub response: ::core::option::Option<attack_response::Response>,
}
/// Nested message and enum types in `AttackResponse`.
pub mod attack_response {
    /// The payload of a server-to-client message.
    #[allow(clippy::derive_partial_eq_without_eq)]
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Response {
        /// Start an increment.
        #[prost(message, tag = "1")]
        Start(super::OperationStart),
        /// Stop an attack or increment.
        #[prost(message, tag = "2")]
        Stop(super::OperationStop),
        /// Terminate the stream.
        #[prost(message, tag = "3")]
        Kill(super::OperationKill),
    }
}
