//! `dbt-rs` is the core of a dynamic binary translation (DBT) library that
//! implements guest instruction-set emulation for x86/x86-64, RISC-V 32/64,
//! and ARM64. See `SPEC_FULL.md` and `DESIGN.md` for the full specification
//! and design ledger.

pub mod arch;
mod backend;
pub mod error;
mod exception;
mod hooks;
mod hst;
mod ir;
mod memory;
mod tb;

pub use error::Error;
