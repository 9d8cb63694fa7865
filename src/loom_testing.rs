#[cfg(loom)]
pub use loom::sync::atomic::AtomicPtr;
#[cfg(not(loom))]
pub use std::sync::atomic::AtomicPtr;

#[cfg(loom)]
pub use loom::thread::ThreadId;
#[cfg(not(loom))]
pub use std::thread::ThreadId;

#[cfg(loom)]
pub fn current_thread_id() -> ThreadId {
    loom::thread::current().id()
}
#[cfg(not(loom))]
pub fn current_thread_id() -> ThreadId {
    std::thread::current().id()
}

#[cfg(loom)]
pub fn spin_hint() {
    loom::thread::yield_now();
}
#[cfg(not(loom))]
pub fn spin_hint() {
    std::hint::spin_loop();
}
