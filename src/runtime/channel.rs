//! Channel 实现
//!
//! 线程安全的有界/无界 FIFO 队列，支持阻塞收发与关闭语义。
//! 协作式任务层与操作系统线程层共用这一原语。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Channel ID 计数器
static CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// 非阻塞发送失败的原因，附带原值
#[derive(Debug, PartialEq, Eq)]
pub enum TrySendError<T> {
    /// 缓冲区已满
    Full(T),
    /// Channel 已关闭
    Closed(T),
}

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(v) | TrySendError::Closed(v) => v,
        }
    }
}

/// 限时接收失败的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvTimeoutError {
    /// 超时且仍未关闭
    Timeout,
    /// 已关闭且为空
    Closed,
}

/// Channel
///
/// 关闭后不再接受发送，但已排队的数据仍可按序取出；
/// 空且已关闭时接收返回 None 而不是阻塞。
pub struct Channel<T> {
    /// Channel ID
    id: u64,
    /// 容量上限（None 表示无界）
    capacity: Option<usize>,
    /// 缓冲区
    buffer: Mutex<VecDeque<T>>,
    /// 是否已关闭
    closed: AtomicBool,
    /// 等待空间的发送者
    send_cond: Condvar,
    /// 等待数据的接收者
    recv_cond: Condvar,
}

impl<T> Channel<T> {
    /// 创建无界 Channel
    pub fn unbounded() -> Self {
        Self::with_limit(None)
    }

    /// 创建有界 Channel（容量至少为 1）
    pub fn bounded(capacity: usize) -> Self {
        Self::with_limit(Some(capacity.max(1)))
    }

    fn with_limit(capacity: Option<usize>) -> Self {
        Self {
            id: CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            capacity,
            buffer: Mutex::new(VecDeque::with_capacity(capacity.unwrap_or(0))),
            closed: AtomicBool::new(false),
            send_cond: Condvar::new(),
            recv_cond: Condvar::new(),
        }
    }

    /// 获取 Channel ID
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 获取容量
    #[inline]
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// 获取当前缓冲区长度
    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// 检查是否为空
    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    /// 检查是否已关闭
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[inline]
    fn has_room(&self, len: usize) -> bool {
        self.capacity.map_or(true, |cap| len < cap)
    }

    /// 发送值（阻塞）
    ///
    /// 返回 Ok(()) 表示发送成功，Err(value) 表示 Channel 已关闭
    pub fn send(&self, value: T) -> Result<(), T> {
        let mut buffer = self.buffer.lock();
        loop {
            if self.is_closed() {
                return Err(value);
            }
            if self.has_room(buffer.len()) {
                buffer.push_back(value);
                self.recv_cond.notify_one();
                return Ok(());
            }
            // 等待空间
            self.send_cond.wait(&mut buffer);
        }
    }

    /// 尝试发送（非阻塞）
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let mut buffer = self.buffer.lock();
        if self.is_closed() {
            return Err(TrySendError::Closed(value));
        }
        if !self.has_room(buffer.len()) {
            return Err(TrySendError::Full(value));
        }
        buffer.push_back(value);
        self.recv_cond.notify_one();
        Ok(())
    }

    /// 接收值（阻塞）
    ///
    /// 返回 Some(value) 表示接收成功，None 表示 Channel 已关闭且为空
    pub fn receive(&self) -> Option<T> {
        let mut buffer = self.buffer.lock();
        loop {
            if let Some(value) = buffer.pop_front() {
                self.send_cond.notify_one();
                return Some(value);
            }
            if self.is_closed() {
                return None;
            }
            // 等待数据
            self.recv_cond.wait(&mut buffer);
        }
    }

    /// 限时接收
    pub fn receive_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        let deadline = Instant::now() + timeout;
        let mut buffer = self.buffer.lock();
        loop {
            if let Some(value) = buffer.pop_front() {
                self.send_cond.notify_one();
                return Ok(value);
            }
            if self.is_closed() {
                return Err(RecvTimeoutError::Closed);
            }
            if self.recv_cond.wait_until(&mut buffer, deadline).timed_out() {
                // 超时后再看一眼，避免与发送者擦肩而过
                return match buffer.pop_front() {
                    Some(value) => {
                        self.send_cond.notify_one();
                        Ok(value)
                    }
                    None if self.is_closed() => Err(RecvTimeoutError::Closed),
                    None => Err(RecvTimeoutError::Timeout),
                };
            }
        }
    }

    /// 尝试接收（非阻塞）
    pub fn try_receive(&self) -> Option<T> {
        let mut buffer = self.buffer.lock();
        let value = buffer.pop_front()?;
        self.send_cond.notify_one();
        Some(value)
    }

    /// 关闭 Channel
    ///
    /// 返回 false 表示之前已经关闭
    pub fn close(&self) -> bool {
        // 持锁修改标志，等待者不会错过唤醒
        let _buffer = self.buffer.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        // 唤醒所有等待者
        self.send_cond.notify_all();
        self.recv_cond.notify_all();
        true
    }
}

impl<T> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_channel_buffered() {
        let ch = Channel::bounded(2);

        assert!(ch.try_send((1, "a")).is_ok());
        assert!(ch.try_send((2, "b")).is_ok());
        assert_eq!(ch.try_send((3, "c")), Err(TrySendError::Full((3, "c")))); // 缓冲区满

        assert_eq!(ch.try_receive(), Some((1, "a")));
        assert_eq!(ch.try_receive(), Some((2, "b")));
        assert!(ch.try_receive().is_none());
    }

    #[test]
    fn test_channel_close() {
        let ch = Channel::bounded(2);

        ch.send(42).unwrap();
        ch.send(43).unwrap();
        assert!(ch.close());
        assert!(!ch.close());

        assert!(ch.is_closed());
        assert_eq!(ch.send(100), Err(100)); // 发送失败
        assert!(matches!(ch.try_send(101), Err(TrySendError::Closed(101))));

        // 仍可按序接收已缓冲的值
        assert_eq!(ch.receive(), Some(42));
        assert_eq!(ch.receive(), Some(43));
        assert_eq!(ch.receive(), None);
        assert_eq!(
            ch.receive_timeout(Duration::from_millis(10)),
            Err(RecvTimeoutError::Closed)
        );
    }

    #[test]
    fn test_receive_blocks_until_send() {
        let ch = Arc::new(Channel::bounded(2));
        let ch_clone = Arc::clone(&ch);

        let receiver = thread::spawn(move || ch_clone.receive());

        thread::sleep(Duration::from_millis(50));
        ch.send(7).unwrap();
        assert_eq!(receiver.join().unwrap(), Some(7));
    }

    #[test]
    fn test_receive_unblocked_by_close() {
        let ch: Arc<Channel<i32>> = Arc::new(Channel::unbounded());
        let ch_clone = Arc::clone(&ch);

        let receiver = thread::spawn(move || ch_clone.receive());

        thread::sleep(Duration::from_millis(50));
        ch.close();
        assert_eq!(receiver.join().unwrap(), None);
    }

    #[test]
    fn test_send_blocks_when_full() {
        let ch = Arc::new(Channel::bounded(1));
        ch.send(1).unwrap();

        let ch_clone = Arc::clone(&ch);
        let sender = thread::spawn(move || ch_clone.send(2));

        thread::sleep(Duration::from_millis(50));
        assert_eq!(ch.len(), 1);
        assert_eq!(ch.receive(), Some(1));
        assert_eq!(sender.join().unwrap(), Ok(()));
        assert_eq!(ch.receive(), Some(2));
    }

    #[test]
    fn test_receive_timeout_expires() {
        let ch: Channel<u8> = Channel::unbounded();
        assert_eq!(
            ch.receive_timeout(Duration::from_millis(20)),
            Err(RecvTimeoutError::Timeout)
        );
    }

    #[test]
    fn test_fifo_per_producer() {
        let ch = Arc::new(Channel::unbounded());
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let ch = Arc::clone(&ch);
                thread::spawn(move || {
                    for i in 0..100 {
                        ch.send((p, i)).unwrap();
                    }
                })
            })
            .collect();
        for handle in producers {
            handle.join().unwrap();
        }
        ch.close();

        let mut last = [-1i32; 4];
        while let Some((p, i)) = ch.receive() {
            assert!(i > last[p]);
            last[p] = i;
        }
        assert_eq!(last, [99; 4]);
    }
}
