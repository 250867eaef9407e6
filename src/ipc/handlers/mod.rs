pub mod averages;
pub mod core;
pub mod grades;
pub mod reports;
pub mod school;
pub mod setup;
