//! Grade averaging and ranking engine behind the `gradebookd` sidecar.

pub mod averages;
pub mod calc;
pub mod config;
pub mod db;
pub mod dirty;
pub mod error;
pub mod grades;
pub mod ipc;
pub mod report;
pub mod school;
