//! epoll 后端
//!
//! 描述符以 EPOLLIN | EPOLLET 注册。`stop` 写 eventfd，
//! 阻塞在 epoll_wait 中的线程会立即醒来并看到停止标志。

use std::io;
use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{CallbackTable, EventCallback, EventLoopBackend, RawDescriptor};
use crate::config::EVENT_BATCH_SIZE;
use crate::error::RuntimeError;

/// eventfd 在 epoll 中的标记
const WAKE_TOKEN: u64 = u64::MAX;

pub struct EpollEventLoop {
    epoll_fd: c_int,
    wake_fd: c_int,
    callbacks: CallbackTable,
    stop_requested: AtomicBool,
}

fn create_error(source: io::Error) -> RuntimeError {
    RuntimeError::EventLoopCreate {
        backend: "epoll",
        source,
    }
}

impl EpollEventLoop {
    pub fn new() -> Result<Self, RuntimeError> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd == -1 {
            return Err(create_error(io::Error::last_os_error()));
        }

        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd == -1 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(create_error(err));
        }

        // 唤醒描述符使用水平触发，每次醒来读空计数
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: WAKE_TOKEN,
        };
        if unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, wake_fd, &mut event) } == -1 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(wake_fd);
                libc::close(epoll_fd);
            }
            return Err(create_error(err));
        }

        Ok(Self {
            epoll_fd,
            wake_fd,
            callbacks: CallbackTable::default(),
            stop_requested: AtomicBool::new(false),
        })
    }

    fn drain_wake(&self) {
        let mut counter: u64 = 0;
        unsafe {
            libc::read(
                self.wake_fd,
                &mut counter as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }

    fn wait_loop(&self) -> Result<(), RuntimeError> {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; EVENT_BATCH_SIZE];

        while !self.stop_requested.load(Ordering::Acquire) {
            let n = unsafe {
                libc::epoll_wait(
                    self.epoll_fd,
                    events.as_mut_ptr(),
                    EVENT_BATCH_SIZE as c_int,
                    -1,
                )
            };
            if n == -1 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue; // 被信号打断，重试
                }
                return Err(RuntimeError::Wait(err));
            }

            for event in &events[..n as usize] {
                let token = event.u64;
                if token == WAKE_TOKEN {
                    self.drain_wake();
                    continue;
                }
                self.callbacks.dispatch(token as RawDescriptor);
            }
        }
        Ok(())
    }
}

impl EventLoopBackend for EpollEventLoop {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn register_source(&self, fd: RawDescriptor, callback: EventCallback) -> Result<(), RuntimeError> {
        let mut event = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut event) } == -1 {
            return Err(RuntimeError::Register {
                descriptor: fd as i64,
                source: io::Error::last_os_error(),
            });
        }
        self.callbacks.insert(fd, callback);
        Ok(())
    }

    fn unregister_event(&self, fd: RawDescriptor) {
        let rc = unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if rc == -1 {
            tracing::warn!(
                target: "regvm::runtime::event_loop",
                fd,
                error = %io::Error::last_os_error(),
                "failed to remove descriptor from epoll"
            );
        }
        self.callbacks.remove(fd);
    }

    fn run(&self) -> Result<(), RuntimeError> {
        let result = self.wait_loop();
        self.stop_requested.store(false, Ordering::Release);
        result
    }

    fn stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        let one: u64 = 1;
        let rc = unsafe {
            libc::write(
                self.wake_fd,
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if rc == -1 {
            tracing::warn!(
                target: "regvm::runtime::event_loop",
                error = %io::Error::last_os_error(),
                "failed to signal epoll wake-up"
            );
        }
    }
}

impl Drop for EpollEventLoop {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_fd);
            libc::close(self.epoll_fd);
        }
    }
}
