// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod cached;
pub mod multi_cached;
pub mod stampede;
pub mod utils;

pub use utils::*;
