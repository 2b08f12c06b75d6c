//! 句柄表
//!
//! 任务、Channel、工作队列都通过整数句柄在寄存器中传递。
//! 句柄表是一个可增长的槽位数组加空闲链表，句柄与任何指针生命周期无关。

/// 句柄表
#[derive(Debug)]
pub struct HandleTable<T> {
    slots: Vec<Option<T>>,
    free: Vec<usize>,
    len: usize,
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// 插入值，优先复用空闲槽位
    pub fn insert(&mut self, value: T) -> usize {
        self.len += 1;
        if let Some(handle) = self.free.pop() {
            self.slots[handle] = Some(value);
            handle
        } else {
            self.slots.push(Some(value));
            self.slots.len() - 1
        }
    }

    /// 在尾部连续分配 `count` 个槽位，返回首个句柄
    ///
    /// 不复用空闲槽位，保证句柄连续。分配后槽位总数超过 `limit` 时不分配，返回 None
    pub fn insert_contiguous(
        &mut self,
        count: usize,
        limit: usize,
        mut make: impl FnMut(usize) -> T,
    ) -> Option<usize> {
        let start = self.slots.len();
        let end = start.checked_add(count).filter(|&end| end <= limit)?;
        self.slots.reserve(count);
        for handle in start..end {
            self.slots.push(Some(make(handle)));
        }
        self.len += count;
        Some(start)
    }

    pub fn remove(&mut self, handle: usize) -> Option<T> {
        let value = self.slots.get_mut(handle)?.take()?;
        self.free.push(handle);
        self.len -= 1;
        Some(value)
    }

    #[inline]
    pub fn get(&self, handle: usize) -> Option<&T> {
        self.slots.get(handle)?.as_ref()
    }

    #[inline]
    pub fn get_mut(&mut self, handle: usize) -> Option<&mut T> {
        self.slots.get_mut(handle)?.as_mut()
    }

    /// 按寄存器中的整数句柄查找（负数视为无效）
    #[inline]
    pub fn lookup(&self, handle: i64) -> Option<&T> {
        usize::try_from(handle).ok().and_then(|h| self.get(h))
    }

    #[inline]
    pub fn lookup_mut(&mut self, handle: i64) -> Option<&mut T> {
        usize::try_from(handle).ok().and_then(move |h| self.get_mut(h))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.len = 0;
    }

    /// 按句柄顺序遍历存活的值
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(handle, slot)| slot.as_ref().map(|v| (handle, v)))
    }

    /// 存活句柄列表（快照）
    pub fn handles(&self) -> Vec<usize> {
        self.iter().map(|(handle, _)| handle).collect()
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
