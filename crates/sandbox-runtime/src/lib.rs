//! Lifecycle orchestration for the sandbox engine.
//!
//! The [`manager::SandboxManager`] owns a registry of isolation modules,
//! orders them by declared dependencies, and drives the five-phase run:
//! initialize (parent), fork, prepare-child (parent) alongside apply-child
//! (child), wait-and-collect, cleanup.

#![allow(unsafe_code)]

pub mod manager;
pub mod result;
