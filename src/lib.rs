//! Staged migration of NAND firmware layouts, from a factory image to the final partition map.

pub mod backup;
pub mod cli;
pub mod env;
pub mod error;
pub mod flash;
pub mod image;
pub mod layout;
pub mod migrate;
pub mod nand;
pub mod system;
pub mod util;
