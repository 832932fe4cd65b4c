#![forbid(unsafe_code)]

mod helix;
pub mod message;
mod session;

pub use helix::{HelixClient, HelixConfig};
pub use message::{IrcMessage, ParseError};
pub use session::{TwitchIrcConfig, TwitchIrcConnector};
