/// Initial capacity of the wait call's output buffer. The buffer doubles
/// whenever a wait saturates it and never shrinks.
pub(crate) const INIT_EVENTS: usize = 128;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        pub(crate) mod epoll;
        pub use epoll::Poller;
    } else if #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "dragonfly",
    ))] {
        pub(crate) mod kqueue;
        pub use kqueue::Poller;
    } else {
        compile_error!("no poller backend for this target: epoll (Linux, Android) and kqueue (macOS, iOS, FreeBSD, DragonFly) are supported");
    }
}
