#![allow(dead_code)]

pub mod agent;
pub mod builders;
pub mod strategies;

pub use agent::*;
pub use builders::*;
pub use strategies::*;
