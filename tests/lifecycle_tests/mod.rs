//! Workflow stories, grouped by what the operator is doing
//!
//! - `create_destroy`: standing a cluster up, tearing it down, and reclaiming
//!   what a failed create left behind
//! - `locking`: two operators contending for the same cluster
//! - `updates`: scaling, upgrading and inspecting a running cluster

mod create_destroy;
mod helpers;
mod locking;
mod updates;
