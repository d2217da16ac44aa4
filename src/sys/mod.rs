pub(crate) mod unix;

pub use unix::Poller;
