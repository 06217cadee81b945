mod client;
mod protocol;
mod pumps;
mod shard;

pub use client::{ClientHandle, OutboundReceiver, OutboundSender};
pub use shard::{ConnectionContext, Shard};
