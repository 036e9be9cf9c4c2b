//! # Service Layer
//!
//! Async runtime integration for the sans-IO [`crate::protocol::link::Link`].
//!
//! ## Components
//! - **Driver**: Tokio task owning the transport, timers and link; exposes a
//!   cloneable [`driver::LinkHandle`] and an event receiver
//!
//! ## Usage
//! ```rust,no_run
//! use std::sync::Arc;
//! use wearable_link::config::LinkConfig;
//! use wearable_link::core::frame::Channel;
//! use wearable_link::protocol::credentials::StaticCredentials;
//! use wearable_link::protocol::link::Link;
//! use wearable_link::service::driver::spawn_link;
//!
//! # async fn run(stream: tokio::io::DuplexStream) -> wearable_link::error::Result<()> {
//! let config = LinkConfig::default();
//! let credentials = StaticCredentials::from_hex("00112233445566778899aabbccddeeff", "phone-1")?;
//! let link = Link::new(config.clone(), Arc::new(credentials))?;
//! let (handle, mut events, task) = spawn_link(link, stream, &config);
//!
//! handle.send(Channel::Command, vec![3, 0, 1, 0]).await?;
//! while let Some(event) = events.recv().await {
//!     tracing::info!(?event, "link event");
//! }
//! task.await.ok();
//! # Ok(())
//! # }
//! ```

pub mod driver;

pub use driver::{spawn_link, LinkHandle};
