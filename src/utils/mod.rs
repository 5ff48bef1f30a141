//! Process-level helpers shared by binaries and services.

pub mod bootstrap;
