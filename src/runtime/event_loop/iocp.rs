//! IOCP 后端
//!
//! 句柄关联到完成端口，完成键即句柄值。`stop` 投递完成键为 -1 的合成完成包，
//! 阻塞在 GetQueuedCompletionStatusEx 中的线程随即醒来。

use std::io;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use winapi::shared::minwindef::{FALSE, ULONG};
use winapi::shared::winerror::WAIT_TIMEOUT;
use winapi::um::errhandlingapi::GetLastError;
use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
use winapi::um::ioapiset::{
    CreateIoCompletionPort, GetQueuedCompletionStatusEx, PostQueuedCompletionStatus,
};
use winapi::um::minwinbase::OVERLAPPED_ENTRY;
use winapi::um::winbase::INFINITE;
use winapi::um::winnt::HANDLE;

use super::{CallbackTable, EventCallback, EventLoopBackend, RawDescriptor};
use crate::config::EVENT_BATCH_SIZE;
use crate::error::RuntimeError;

/// 停止完成包的完成键（-1）
const STOP_KEY: usize = usize::MAX;

/// 完成端口句柄
struct Port(HANDLE);

unsafe impl Send for Port {}
unsafe impl Sync for Port {}

pub struct IocpEventLoop {
    port: Port,
    callbacks: CallbackTable,
    stop_requested: AtomicBool,
}

impl IocpEventLoop {
    pub fn new() -> Result<Self, RuntimeError> {
        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, ptr::null_mut(), 0, 0) };
        if port.is_null() {
            return Err(RuntimeError::EventLoopCreate {
                backend: "iocp",
                source: io::Error::last_os_error(),
            });
        }
        Ok(Self {
            port: Port(port),
            callbacks: CallbackTable::default(),
            stop_requested: AtomicBool::new(false),
        })
    }

    fn wait_loop(&self) -> Result<(), RuntimeError> {
        let mut entries: [OVERLAPPED_ENTRY; EVENT_BATCH_SIZE] = unsafe { std::mem::zeroed() };

        while !self.stop_requested.load(Ordering::Acquire) {
            let mut removed: ULONG = 0;
            let ok = unsafe {
                GetQueuedCompletionStatusEx(
                    self.port.0,
                    entries.as_mut_ptr(),
                    EVENT_BATCH_SIZE as ULONG,
                    &mut removed,
                    INFINITE,
                    FALSE,
                )
            };
            if ok == 0 {
                let code = unsafe { GetLastError() };
                if code == WAIT_TIMEOUT {
                    continue;
                }
                return Err(RuntimeError::Wait(io::Error::from_raw_os_error(code as i32)));
            }

            for entry in &entries[..removed as usize] {
                let key = entry.lpCompletionKey;
                if key == STOP_KEY {
                    continue;
                }
                self.callbacks.dispatch(key as RawDescriptor);
            }
        }
        Ok(())
    }
}

impl EventLoopBackend for IocpEventLoop {
    fn name(&self) -> &'static str {
        "iocp"
    }

    fn register_source(&self, fd: RawDescriptor, callback: EventCallback) -> Result<(), RuntimeError> {
        let handle = fd as HANDLE;
        let port = unsafe { CreateIoCompletionPort(handle, self.port.0, fd as usize, 0) };
        if port.is_null() {
            return Err(RuntimeError::Register {
                descriptor: fd as i64,
                source: io::Error::last_os_error(),
            });
        }
        self.callbacks.insert(fd, callback);
        Ok(())
    }

    /// 完成端口无法解除关联，只移除回调
    fn unregister_event(&self, fd: RawDescriptor) {
        if !self.callbacks.remove(fd) {
            tracing::warn!(
                target: "regvm::runtime::event_loop",
                fd,
                "descriptor was not registered with iocp"
            );
        }
    }

    fn run(&self) -> Result<(), RuntimeError> {
        let result = self.wait_loop();
        self.stop_requested.store(false, Ordering::Release);
        result
    }

    fn stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        let ok = unsafe { PostQueuedCompletionStatus(self.port.0, 0, STOP_KEY, ptr::null_mut()) };
        if ok == 0 {
            tracing::warn!(
                target: "regvm::runtime::event_loop",
                error = %io::Error::last_os_error(),
                "failed to post iocp stop packet"
            );
        }
    }
}

impl Drop for IocpEventLoop {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.port.0);
        }
    }
}
