//! A Telegram bot that forwards user prompts to several AI backends.
//!
//! Telegramus is built on the [`teloxide`](https://docs.rs/teloxide/latest/teloxide/)
//! framework. Prompts from Telegram users are queued and processed one
//! at a time by a worker that dispatches them to the selected backend
//! (ChatGPT, DALL-E, EdgeGPT, Bard or Bing Image Creator) and streams
//! the answer back by editing the reply message.
//!
//! ## Getting Started
//!
//! Telegramus is a single-binary executable configured through a JSON
//! settings file:
//!
//! ```shell
//! $ /path/to/telegramus -s your_settings.json
//! ```
//!
//! The settings format is described in the [`config`] module. The bot
//! can also be embedded in another process through the [`app`] module.

#[macro_use]
extern crate log;
#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate async_trait;

pub mod app;
pub mod config;

mod bot;
mod collector;
mod conversation;
mod dispatch;
mod error;
mod modules;
mod proxy;
mod queue;
mod request;
mod users;
mod utils;
