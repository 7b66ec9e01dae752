pub mod chat;
pub mod reissue;
pub mod stomp;
