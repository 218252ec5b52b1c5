//! Core library for `sshm`: the credential model and configuration store,
//! the OS secret-store abstraction, at-rest encryption of stored passwords,
//! and terminal prompting.
//!
//! The SSH-facing pieces (key generation, authentication resolution, the
//! interactive session driver) live in `sshm-ssh`, which builds on the types
//! defined here.

pub mod cipher;
pub mod config;
pub mod keystore;
pub mod prompt;
