//! Networked cluster mode: framed chunk protocol over TCP
//!
//! A node runs a [`ChunkServer`] over its [`NodeAgent`](crate::NodeAgent);
//! peers reach it through a [`TcpTransport`].

pub mod client;
pub mod frames;
pub mod server;

pub use client::TcpTransport;
pub use frames::{frame_type, ChunkRequest, FrameHeader, Message};
pub use server::ChunkServer;
