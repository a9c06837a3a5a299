// src/assign/mod.rs

//! Matching tasks to workers.
//!
//! - [`assignment`] pairs one task with whichever worker accepts it.
//! - [`factory`] keeps, per series, the FIFO of tasks nobody has picked up
//!   and the FIFO of worker requests nobody has filled, and pairs whichever
//!   side arrives second.
//!
//! No priority is applied here: tasks are matched in the order they are
//! submitted, so whoever feeds the handler decides the precedence.

pub mod assignment;
pub mod factory;

pub use assignment::{Accepted, Assignment};
pub use factory::{AssignmentFactory, Match, RequestId};
