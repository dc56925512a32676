#![deny(dead_code)]
#![deny(unused_imports)]

pub mod boost;
pub mod cohort;
pub mod config;
pub mod data;
pub mod evaluate;
pub mod linear;
pub mod metrics;
pub mod model;
pub mod preprocess;
pub mod progress;
pub mod search;
pub mod workflow;
