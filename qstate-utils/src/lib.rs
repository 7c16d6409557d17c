mod hash;
pub use hash::*;
mod json;
pub use json::*;
pub mod tolerance;
pub use tolerance::{allclose, assert_close, count_not_close, mean_abs_error};
