pub mod client;
pub mod command;
pub mod update;

pub use client::TelegramClient;
pub use command::{parse_message, BotCommand, ParseResult};
pub use update::{Chat, Message, TelegramUser, Update};
