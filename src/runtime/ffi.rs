//! C 钩子边界
//!
//! 嵌入方可以通过不透明句柄和 `extern "C"` 入口替换并发后端，
//! 而无需重新编译分发循环。所有入口以 bool 标志报告成功与否，不跨边界展开。

use std::alloc::{self, Layout};
use std::cell::Cell;
use std::ffi::c_void;
use std::ptr;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::channel::Channel;
use super::scheduler::Scheduler;
use super::thread_pool::ThreadPool;

/// 任务入口
pub type TaskFn = unsafe extern "C" fn(arg: *mut c_void);

/// 调度器句柄
pub struct SchedulerHandle(Arc<Scheduler>);

/// 线程池句柄
pub struct ThreadPoolHandle(ThreadPool);

/// Channel 句柄，负载为 i64
pub struct ChannelHandle(Channel<i64>);

/// 已派生任务的句柄
pub struct TaskHandle(Arc<TaskSlot>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Pending,
    Running,
    Finished,
    Cancelled,
}

struct TaskSlot {
    state: Mutex<SlotState>,
    done: Condvar,
}

impl TaskSlot {
    fn transition(&self, from: SlotState, to: SlotState) -> bool {
        let mut state = self.state.lock();
        if *state != from {
            return false;
        }
        *state = to;
        if matches!(to, SlotState::Finished | SlotState::Cancelled) {
            self.done.notify_all();
        }
        true
    }
}

/// 跨线程传递的 C 参数指针
struct SendPtr(*mut c_void);

unsafe impl Send for SendPtr {}

impl SendPtr {
    fn get(self) -> *mut c_void {
        self.0
    }
}

fn job(func: TaskFn, arg: *mut c_void) -> impl FnOnce() + Send + 'static {
    let arg = SendPtr(arg);
    move || unsafe { func(arg.get()) }
}

thread_local! {
    /// 当前线程的错误上下文（0 表示无错误）
    static ERROR_CONTEXT: Cell<i64> = const { Cell::new(0) };
}

// ============================================================================
// 调度器
// ============================================================================

#[no_mangle]
pub extern "C" fn regvm_scheduler_create() -> *mut SchedulerHandle {
    Box::into_raw(Box::new(SchedulerHandle(Arc::new(Scheduler::new()))))
}

/// # Safety
/// `scheduler` 必须来自 `regvm_scheduler_create` 且未被销毁
#[no_mangle]
pub unsafe extern "C" fn regvm_scheduler_destroy(scheduler: *mut SchedulerHandle) {
    if !scheduler.is_null() {
        drop(Box::from_raw(scheduler));
    }
}

/// # Safety
/// `scheduler` 必须有效；`arg` 在任务执行前必须保持有效
#[no_mangle]
pub unsafe extern "C" fn regvm_scheduler_submit(
    scheduler: *mut SchedulerHandle,
    func: Option<TaskFn>,
    arg: *mut c_void,
) -> bool {
    let (Some(scheduler), Some(func)) = (scheduler.as_ref(), func) else {
        return false;
    };
    scheduler.0.submit(job(func, arg)).is_ok()
}

/// # Safety
/// `scheduler` 必须有效
#[no_mangle]
pub unsafe extern "C" fn regvm_scheduler_shutdown(scheduler: *mut SchedulerHandle) -> bool {
    match scheduler.as_ref() {
        Some(scheduler) => {
            scheduler.0.shutdown();
            true
        }
        None => false,
    }
}

// ============================================================================
// 线程池
// ============================================================================

/// # Safety
/// `scheduler` 必须有效；线程池持有调度器的共享引用
#[no_mangle]
pub unsafe extern "C" fn regvm_thread_pool_create(
    num_threads: usize,
    scheduler: *mut SchedulerHandle,
) -> *mut ThreadPoolHandle {
    match scheduler.as_ref() {
        Some(scheduler) => Box::into_raw(Box::new(ThreadPoolHandle(ThreadPool::new(
            num_threads,
            Arc::clone(&scheduler.0),
        )))),
        None => ptr::null_mut(),
    }
}

/// # Safety
/// `pool` 必须有效
#[no_mangle]
pub unsafe extern "C" fn regvm_thread_pool_start(pool: *mut ThreadPoolHandle) -> bool {
    let Some(pool) = pool.as_ref() else {
        return false;
    };
    match pool.0.start() {
        Ok(()) => true,
        Err(error) => {
            tracing::error!(target: "regvm::runtime::ffi", %error, "thread pool start failed");
            false
        }
    }
}

/// # Safety
/// `pool` 必须有效
#[no_mangle]
pub unsafe extern "C" fn regvm_thread_pool_stop(pool: *mut ThreadPoolHandle) -> bool {
    match pool.as_ref() {
        Some(pool) => {
            pool.0.stop();
            true
        }
        None => false,
    }
}

/// 销毁前会停止并汇合工作线程
///
/// # Safety
/// `pool` 必须来自 `regvm_thread_pool_create` 且未被销毁
#[no_mangle]
pub unsafe extern "C" fn regvm_thread_pool_destroy(pool: *mut ThreadPoolHandle) {
    if !pool.is_null() {
        drop(Box::from_raw(pool));
    }
}

// ============================================================================
// 任务
// ============================================================================

/// 在线程池上派生任务，返回可 join/cancel 的句柄
///
/// # Safety
/// `pool` 必须有效；`arg` 在任务执行前必须保持有效
#[no_mangle]
pub unsafe extern "C" fn regvm_task_spawn(
    pool: *mut ThreadPoolHandle,
    func: Option<TaskFn>,
    arg: *mut c_void,
) -> *mut TaskHandle {
    let (Some(pool), Some(func)) = (pool.as_ref(), func) else {
        return ptr::null_mut();
    };

    let slot = Arc::new(TaskSlot {
        state: Mutex::new(SlotState::Pending),
        done: Condvar::new(),
    });
    let worker_slot = Arc::clone(&slot);
    let run = job(func, arg);
    let submitted = pool.0.submit(move || {
        if worker_slot.transition(SlotState::Pending, SlotState::Running) {
            run();
            worker_slot.transition(SlotState::Running, SlotState::Finished);
        }
    });

    match submitted {
        Ok(()) => Box::into_raw(Box::new(TaskHandle(slot))),
        Err(_) => ptr::null_mut(),
    }
}

/// 等待任务结束；任务被取消时返回 false
///
/// # Safety
/// `task` 必须有效
#[no_mangle]
pub unsafe extern "C" fn regvm_task_join(task: *mut TaskHandle) -> bool {
    let Some(task) = task.as_ref() else {
        return false;
    };
    let slot = &task.0;
    let mut state = slot.state.lock();
    while matches!(*state, SlotState::Pending | SlotState::Running) {
        slot.done.wait(&mut state);
    }
    *state == SlotState::Finished
}

/// 取消尚未开始的任务；已开始的任务会执行到底
///
/// # Safety
/// `task` 必须有效
#[no_mangle]
pub unsafe extern "C" fn regvm_task_cancel(task: *mut TaskHandle) -> bool {
    match task.as_ref() {
        Some(task) => task.0.transition(SlotState::Pending, SlotState::Cancelled),
        None => false,
    }
}

/// # Safety
/// `task` 必须来自 `regvm_task_spawn` 且未被销毁
#[no_mangle]
pub unsafe extern "C" fn regvm_task_destroy(task: *mut TaskHandle) {
    if !task.is_null() {
        drop(Box::from_raw(task));
    }
}

// ============================================================================
// Channel
// ============================================================================

/// 容量为 0 时创建无界 Channel
#[no_mangle]
pub extern "C" fn regvm_channel_create(capacity: usize) -> *mut ChannelHandle {
    let channel = if capacity == 0 {
        Channel::unbounded()
    } else {
        Channel::bounded(capacity)
    };
    Box::into_raw(Box::new(ChannelHandle(channel)))
}

/// 阻塞发送；已关闭时返回 false
///
/// # Safety
/// `channel` 必须有效
#[no_mangle]
pub unsafe extern "C" fn regvm_channel_send(channel: *mut ChannelHandle, value: i64) -> bool {
    channel
        .as_ref()
        .map_or(false, |channel| channel.0.send(value).is_ok())
}

/// 阻塞接收；已关闭且为空时返回 false
///
/// # Safety
/// `channel` 与 `out` 必须有效
#[no_mangle]
pub unsafe extern "C" fn regvm_channel_receive(channel: *mut ChannelHandle, out: *mut i64) -> bool {
    let Some(channel) = channel.as_ref() else {
        return false;
    };
    if out.is_null() {
        return false;
    }
    match channel.0.receive() {
        Some(value) => {
            *out = value;
            true
        }
        None => false,
    }
}

/// # Safety
/// `channel` 必须有效
#[no_mangle]
pub unsafe extern "C" fn regvm_channel_close(channel: *mut ChannelHandle) -> bool {
    channel.as_ref().map_or(false, |channel| channel.0.close())
}

/// # Safety
/// `channel` 必须来自 `regvm_channel_create` 且未被销毁
#[no_mangle]
pub unsafe extern "C" fn regvm_channel_destroy(channel: *mut ChannelHandle) {
    if !channel.is_null() {
        drop(Box::from_raw(channel));
    }
}

// ============================================================================
// 错误上下文 / 共享内存
// ============================================================================

/// 设置当前线程的错误码
#[no_mangle]
pub extern "C" fn regvm_error_set(code: i64) {
    ERROR_CONTEXT.with(|ctx| ctx.set(code));
}

/// 取出并清除当前线程的错误码（0 表示无错误）
#[no_mangle]
pub extern "C" fn regvm_error_take() -> i64 {
    ERROR_CONTEXT.with(|ctx| ctx.replace(0))
}

/// 分配清零的共享内存；尺寸为 0 或对齐非法时返回空指针
#[no_mangle]
pub extern "C" fn regvm_shared_alloc(size: usize, align: usize) -> *mut u8 {
    if size == 0 {
        return ptr::null_mut();
    }
    match Layout::from_size_align(size, align) {
        Ok(layout) => unsafe { alloc::alloc_zeroed(layout) },
        Err(_) => ptr::null_mut(),
    }
}

/// # Safety
/// `ptr` 必须来自 `regvm_shared_alloc`，且 `size`/`align` 与分配时一致
#[no_mangle]
pub unsafe extern "C" fn regvm_shared_free(ptr: *mut u8, size: usize, align: usize) -> bool {
    if ptr.is_null() {
        return false;
    }
    match Layout::from_size_align(size, align) {
        Ok(layout) => {
            alloc::dealloc(ptr, layout);
            true
        }
        Err(_) => false,
    }
}

// ============================================================================
// 钩子表
// ============================================================================

/// 并发后端钩子表
///
/// 嵌入方可以提供自己的实现；`native()` 返回本 crate 的实现。
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RuntimeHooks {
    pub spawn: unsafe extern "C" fn(*mut ThreadPoolHandle, Option<TaskFn>, *mut c_void) -> *mut TaskHandle,
    pub join: unsafe extern "C" fn(*mut TaskHandle) -> bool,
    pub cancel: unsafe extern "C" fn(*mut TaskHandle) -> bool,
    pub channel_create: extern "C" fn(usize) -> *mut ChannelHandle,
    pub channel_send: unsafe extern "C" fn(*mut ChannelHandle, i64) -> bool,
    pub channel_receive: unsafe extern "C" fn(*mut ChannelHandle, *mut i64) -> bool,
    pub channel_close: unsafe extern "C" fn(*mut ChannelHandle) -> bool,
    pub error_set: extern "C" fn(i64),
    pub error_take: extern "C" fn() -> i64,
    pub shared_alloc: extern "C" fn(usize, usize) -> *mut u8,
    pub shared_free: unsafe extern "C" fn(*mut u8, usize, usize) -> bool,
}

impl RuntimeHooks {
    pub fn native() -> Self {
        Self {
            spawn: regvm_task_spawn,
            join: regvm_task_join,
            cancel: regvm_task_cancel,
            channel_create: regvm_channel_create,
            channel_send: regvm_channel_send,
            channel_receive: regvm_channel_receive,
            channel_close: regvm_channel_close,
            error_set: regvm_error_set,
            error_take: regvm_error_take,
            shared_alloc: regvm_shared_alloc,
            shared_free: regvm_shared_free,
        }
    }
}

impl Default for RuntimeHooks {
    fn default() -> Self {
        Self::native()
    }
}
