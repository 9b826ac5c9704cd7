pub mod daemon;
pub mod data;
pub mod helpers;
