mod consumer;
mod engine;
mod replay;

pub use consumer::{base_client_config, RdKafkaConsumer, RecordStream};
pub use engine::{run_consumer_loop, spawn_consumer_pool};
pub use replay::{replay, MAX_REPLAY_MESSAGES, REPLAY_TIMEOUT};
