//! Types used in the Refrain runtime.

pub mod args;
pub mod array;
pub mod cell;
pub mod exception;
pub mod function;
pub mod object;
pub mod symbol;
pub mod template;
pub mod value;
