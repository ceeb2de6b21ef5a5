//! Shared mocks and fixtures for FlowForge tests.

mod fixtures;
mod observer;
mod services;

pub use fixtures::{config_file, linear_graph};
pub use observer::{ObservedEvent, RecordingObserver};
pub use services::{FnSandbox, RecordingHttpProxy, ScriptedChat, StaticEmbedding, StaticVision};

pub use flowforge_memory::InMemoryStore;
