#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Node CIDR controller
//!
//! Watches the cluster's node inventory and drives each node toward its
//! desired state: a node matching the configured label selector receives the
//! next free pod CIDR from the cluster supernet, a node carrying a configured
//! taint has that taint stripped, and a deleted node returns its CIDR to the
//! free pool.

pub mod admin;
pub mod cidr;
mod controller;
pub mod k8s;
pub mod labels;
pub mod lease;
mod queue;
pub mod taints;

pub use self::controller::Controller;
pub use self::queue::WorkQueue;
