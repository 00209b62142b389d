//! Command-line front end for shapeshift.

pub mod commands;
pub mod input;
