//! 跨平台事件循环
//!
//! 对操作系统 I/O 多路复用的统一抽象：把描述符/句柄映射到回调，
//! 阻塞等待就绪（或完成）批次并分发。
//!
//! - Linux: epoll，边缘触发，eventfd 唤醒
//! - macOS / FreeBSD: kqueue，EVFILT_USER 唤醒
//! - Windows: IOCP，完成键 -1 的合成完成包唤醒

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::RuntimeError;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
mod kqueue;
#[cfg(windows)]
mod iocp;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use epoll::EpollEventLoop as PlatformEventLoop;
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
pub use kqueue::KqueueEventLoop as PlatformEventLoop;
#[cfg(windows)]
pub use iocp::IocpEventLoop as PlatformEventLoop;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    windows
)))]
compile_error!("no event loop backend for this target");

/// 原生描述符：POSIX 文件描述符
#[cfg(unix)]
pub type RawDescriptor = std::os::raw::c_int;

/// 原生描述符：Windows HANDLE / SOCKET 的整数值
#[cfg(windows)]
pub type RawDescriptor = isize;

/// "无描述符"哨兵：注册时立即同步执行回调
pub const NO_DESCRIPTOR: RawDescriptor = -1;

/// 事件回调，参数为就绪的描述符
pub type EventCallback = Arc<dyn Fn(RawDescriptor) + Send + Sync>;

/// 事件循环后端
///
/// 所有方法取 `&self`：`run` 阻塞在一个线程上，`stop` 可以从回调或其它线程调用。
pub trait EventLoopBackend: Send + Sync {
    /// 后端名称
    fn name(&self) -> &'static str;

    /// 把真实描述符加入多路复用集合
    fn register_source(&self, fd: RawDescriptor, callback: EventCallback) -> Result<(), RuntimeError>;

    /// 注销描述符；失败只记录日志
    fn unregister_event(&self, fd: RawDescriptor);

    /// 阻塞等待并分发，直到 `stop`
    fn run(&self) -> Result<(), RuntimeError>;

    /// 请求停止并唤醒阻塞中的 `run`
    fn stop(&self);

    /// 注册事件；`NO_DESCRIPTOR` 立即执行回调而不注册
    fn register_event(&self, fd: RawDescriptor, callback: EventCallback) -> Result<(), RuntimeError> {
        if fd == NO_DESCRIPTOR {
            callback(fd);
            return Ok(());
        }
        self.register_source(fd, callback)
    }
}

/// 描述符 -> 回调表
#[derive(Default)]
pub(crate) struct CallbackTable {
    map: Mutex<HashMap<RawDescriptor, EventCallback>>,
}

impl CallbackTable {
    pub(crate) fn insert(&self, fd: RawDescriptor, callback: EventCallback) {
        self.map.lock().insert(fd, callback);
    }

    pub(crate) fn remove(&self, fd: RawDescriptor) -> bool {
        self.map.lock().remove(&fd).is_some()
    }

    /// 调用回调；回调执行时不持锁，因此可以在回调里注册/注销/停止
    pub(crate) fn dispatch(&self, fd: RawDescriptor) {
        let callback = self.map.lock().get(&fd).cloned();
        if let Some(callback) = callback {
            callback(fd);
        }
    }
}

/// 事件循环
pub struct EventLoop {
    backend: Box<dyn EventLoopBackend>,
}

impl EventLoop {
    /// 创建当前平台的事件循环；多路复用句柄创建失败是致命错误
    pub fn new() -> Result<Self, RuntimeError> {
        Ok(Self::with_backend(Box::new(PlatformEventLoop::new()?)))
    }

    /// 使用自定义后端
    pub fn with_backend(backend: Box<dyn EventLoopBackend>) -> Self {
        Self { backend }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// 注册描述符回调
    pub fn register_event<F>(&self, fd: RawDescriptor, callback: F) -> Result<(), RuntimeError>
    where
        F: Fn(RawDescriptor) + Send + Sync + 'static,
    {
        self.backend.register_event(fd, Arc::new(callback))
    }

    pub fn unregister_event(&self, fd: RawDescriptor) {
        self.backend.unregister_event(fd);
    }

    pub fn run(&self) -> Result<(), RuntimeError> {
        self.backend.run()
    }

    pub fn stop(&self) {
        self.backend.stop();
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("backend", &self.backend.name())
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_no_descriptor_runs_immediately() {
        let event_loop = EventLoop::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        event_loop
            .register_event(NO_DESCRIPTOR, move |fd| {
                assert_eq!(fd, NO_DESCRIPTOR);
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_readable_socket_dispatches_callback() {
        let (reader, mut writer) = UnixStream::pair().unwrap();
        reader.set_nonblocking(true).unwrap();
        let fd = reader.as_raw_fd();

        let event_loop = Arc::new(EventLoop::new().unwrap());
        let received = Arc::new(parking_lot::Mutex::new(Vec::new()));

        {
            let event_loop_cb = Arc::clone(&event_loop);
            let received = Arc::clone(&received);
            let reader = Mutex::new(reader);
            event_loop
                .register_event(fd, move |ready| {
                    assert_eq!(ready, fd);
                    let mut buf = [0u8; 16];
                    if let Ok(n) = reader.lock().read(&mut buf) {
                        received.lock().extend_from_slice(&buf[..n]);
                    }
                    event_loop_cb.stop();
                })
                .unwrap();
        }

        let runner = {
            let event_loop = Arc::clone(&event_loop);
            thread::spawn(move || event_loop.run())
        };

        thread::sleep(Duration::from_millis(20));
        writer.write_all(b"ping").unwrap();
        runner.join().unwrap().unwrap();

        assert_eq!(&*received.lock(), b"ping");
        event_loop.unregister_event(fd);
    }

    #[test]
    fn test_stop_wakes_blocked_run() {
        let event_loop = Arc::new(EventLoop::new().unwrap());
        let runner = {
            let event_loop = Arc::clone(&event_loop);
            thread::spawn(move || event_loop.run())
        };

        thread::sleep(Duration::from_millis(50));
        let stopped_at = Instant::now();
        event_loop.stop();
        runner.join().unwrap().unwrap();
        assert!(stopped_at.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_stop_before_run_returns_promptly() {
        let event_loop = EventLoop::new().unwrap();
        event_loop.stop();
        event_loop.run().unwrap();
    }

    #[test]
    fn test_unregister_unknown_descriptor_is_swallowed() {
        let event_loop = EventLoop::new().unwrap();
        event_loop.unregister_event(12345);
    }
}
