//! chainreader-handlers — contract handlers shipped with ChainReader.
//!
//! - [`TokenHandler`]: balances, supplies and transfers of a standard token contract.

pub mod asset;
pub mod token;

pub use asset::{Asset, AssetError};
pub use token::{TokenCache, TokenHandler, TokenStat, TOKEN_ABI};
