//! kqueue 后端
//!
//! 读就绪以 EVFILT_READ 注册。构造时额外注册一个 EVFILT_USER 事件，
//! `stop` 触发它来唤醒阻塞在 kevent 中的线程。

use std::io;
use std::os::raw::c_int;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{CallbackTable, EventCallback, EventLoopBackend, RawDescriptor};
use crate::config::EVENT_BATCH_SIZE;
use crate::error::RuntimeError;

/// 唤醒用户事件的标识
const WAKE_IDENT: usize = usize::MAX;

fn make_kevent(ident: usize, filter: i16, flags: u16, fflags: u32) -> libc::kevent {
    // 各平台 kevent 的尾部字段不同，先清零再填
    let mut event: libc::kevent = unsafe { std::mem::zeroed() };
    event.ident = ident as _;
    event.filter = filter as _;
    event.flags = flags as _;
    event.fflags = fflags as _;
    event
}

pub struct KqueueEventLoop {
    kq: c_int,
    callbacks: CallbackTable,
    stop_requested: AtomicBool,
}

impl KqueueEventLoop {
    pub fn new() -> Result<Self, RuntimeError> {
        let kq = unsafe { libc::kqueue() };
        if kq == -1 {
            return Err(RuntimeError::EventLoopCreate {
                backend: "kqueue",
                source: io::Error::last_os_error(),
            });
        }

        let wake = make_kevent(
            WAKE_IDENT,
            libc::EVFILT_USER as i16,
            (libc::EV_ADD | libc::EV_CLEAR) as u16,
            0,
        );
        if unsafe { libc::kevent(kq, &wake, 1, ptr::null_mut(), 0, ptr::null()) } == -1 {
            let source = io::Error::last_os_error();
            unsafe { libc::close(kq) };
            return Err(RuntimeError::EventLoopCreate {
                backend: "kqueue",
                source,
            });
        }

        Ok(Self {
            kq,
            callbacks: CallbackTable::default(),
            stop_requested: AtomicBool::new(false),
        })
    }

    fn change(&self, event: &libc::kevent) -> io::Result<()> {
        if unsafe { libc::kevent(self.kq, event, 1, ptr::null_mut(), 0, ptr::null()) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn wait_loop(&self) -> Result<(), RuntimeError> {
        let mut events: [libc::kevent; EVENT_BATCH_SIZE] = unsafe { std::mem::zeroed() };

        while !self.stop_requested.load(Ordering::Acquire) {
            let n = unsafe {
                libc::kevent(
                    self.kq,
                    ptr::null(),
                    0,
                    events.as_mut_ptr(),
                    EVENT_BATCH_SIZE as c_int,
                    ptr::null(),
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
                if event.filter as i16 == libc::EVFILT_USER as i16 {
                    continue;
                }
                self.callbacks.dispatch(event.ident as RawDescriptor);
            }
        }
        Ok(())
    }
}

impl EventLoopBackend for KqueueEventLoop {
    fn name(&self) -> &'static str {
        "kqueue"
    }

    fn register_source(&self, fd: RawDescriptor, callback: EventCallback) -> Result<(), RuntimeError> {
        let event = make_kevent(
            fd as usize,
            libc::EVFILT_READ as i16,
            (libc::EV_ADD | libc::EV_ENABLE) as u16,
            0,
        );
        self.change(&event).map_err(|source| RuntimeError::Register {
            descriptor: fd as i64,
            source,
        })?;
        self.callbacks.insert(fd, callback);
        Ok(())
    }

    fn unregister_event(&self, fd: RawDescriptor) {
        let event = make_kevent(fd as usize, libc::EVFILT_READ as i16, libc::EV_DELETE as u16, 0);
        if let Err(error) = self.change(&event) {
            tracing::warn!(
                target: "regvm::runtime::event_loop",
                fd,
                %error,
                "failed to remove descriptor from kqueue"
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
        let trigger = make_kevent(WAKE_IDENT, libc::EVFILT_USER as i16, 0, libc::NOTE_TRIGGER as u32);
        if let Err(error) = self.change(&trigger) {
            tracing::warn!(
                target: "regvm::runtime::event_loop",
                %error,
                "failed to trigger kqueue wake-up"
            );
        }
    }
}

impl Drop for KqueueEventLoop {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kq);
        }
    }
}
