// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod mutations;
pub mod portfolio;
pub mod sweeping;
pub mod utils;

pub use utils::*;
