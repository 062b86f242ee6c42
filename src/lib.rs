pub mod autoplay;
pub mod bot;
pub mod commands;
pub mod config;
pub mod gambling;
pub mod health;
pub mod lifecycle;
pub mod logging;
pub mod parsing;
pub mod sender;
pub mod session;
pub mod transport;
pub mod trusted;
pub mod wallet;

pub mod test_helpers;
