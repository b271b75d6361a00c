//! Protobuf and gRPC bindings for the `schedulo.Scheduler` service.
//!
//! `proto/schedulo.proto` is the source of truth; the generated module is
//! checked in so ordinary builds do not need protoc on the path.

pub mod schedulo;
