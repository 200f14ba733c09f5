//! End-to-end SSH integration tests for shat_sshd.

#[path = "../common/mod.rs"]
mod common;

mod auth;
mod connection;
mod pty;
