//! Custom types used during evaluation
mod grad;
mod interval;

pub use grad::Grad;
pub use interval::{Interval, State};
