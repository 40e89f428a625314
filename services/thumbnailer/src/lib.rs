//! Thumbnailer
//!
//! Worker that turns "a file changed" requests into resized copies of
//! original images. It consumes two RabbitMQ queues, one asking for the
//! thumbnails of an original to be (re)generated and one asking for them to
//! be removed, and writes JPEG thumbnails at each configured width into a
//! directory tree mirroring the originals.
//!
//! ## Architecture
//!
//! ```text
//! RabbitMQ (direct exchange)
//! ┌──────────────┐   ┌──────────────┐
//! │ gen queue    │   │ del queue    │
//! └──────────────┘   └──────────────┘
//!        │                  │
//!        ▼                  ▼
//! ┌─────────────────────────────────┐
//! │ AmqpConsumer (one loop / queue) │──────┐
//! └─────────────────────────────────┘      │
//!                 │                        │ counters
//!                 ▼                        ▼
//! ┌─────────────────────────────────┐ ┌──────────────┐
//! │ ThumbnailsService               │ │ MetricsSink  │
//! │ cleanup → meta → generate       │ └──────────────┘
//! └─────────────────────────────────┘      ▲
//!                 │                        │
//!                 ▼                        │
//! ┌─────────────────────────────────┐      │
//! │ ThumbsGenerator (image crate)   │──────┘
//! └─────────────────────────────────┘
//!                 │
//!                 ▼
//!   <thumbnails_root>/<dir>/<name>_<width>px.jpg
//! ```

pub mod amqp_consumer;
pub mod config;
pub mod image_generator;
pub mod models;
pub mod telemetry;
pub mod thumbnails;
pub mod thumbs_gen;

pub use amqp_consumer::{AmqpConsumer, ConsumerError, MessageConsumer, RequestHandler};
pub use config::{Config, ConfigError, LogFormat};
pub use image_generator::ImageThumbsGenerator;
pub use models::{RequestKind, ThumbRequest};
pub use telemetry::{init_metrics, Counter, MetricsSink, NoopMetrics, PrometheusMetrics};
pub use thumbnails::ThumbnailsService;
pub use thumbs_gen::{ThumbnailError, ThumbnailMeta, ThumbsGenerator};
