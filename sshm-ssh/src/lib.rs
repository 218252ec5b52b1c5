//! SSH-facing half of sshm: key-pair generation and serialization,
//! authentication-method resolution, and the interactive session driver
//! that takes a resolved credential all the way to a remote shell.

pub mod auth;
pub mod keygen;
pub mod session;
pub mod term;
