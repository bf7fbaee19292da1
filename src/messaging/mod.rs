mod channel;
mod port;

pub use channel::MessageChannel;
pub use port::MessagePort;
