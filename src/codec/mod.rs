//! Wire codecs shared by the session's system channel.

pub mod packed;
pub mod pingpong;
