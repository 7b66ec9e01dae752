// chatgen-common: wire types shared by the chatgen crates.

pub mod event;
pub mod protocol;
