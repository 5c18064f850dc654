//! kafka-mux - Kafka connection multiplexer
//!
//! Lets many logical producers and consumers inside one process share a
//! single consumer-group client, one synchronous producer and one
//! asynchronous producer.

pub mod client;
pub mod config;
pub mod mux;
pub mod serializer;
pub mod utils;

pub use client::{ClientError, ConsumerMessage, Metadata, ProducerError, ProducerMessage};
pub use mux::{Connection, Multiplexer, MuxError, MuxOptions, ProtoConnection};
pub use serializer::{JsonSerializer, ProtoSerializer, SerializeError, Serializer};
