use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

/// Ёмкость очереди канала по умолчанию.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Потокобезопасная FIFO-очередь с ограниченной ёмкостью.
///
/// Переполнение не блокирует производителя: перед вставкой в полную очередь
/// из её головы выбрасывается самый старый элемент (drop-oldest). Потребитель
/// блокируется в [`BoundedQueue::wait_and_pop`] до появления элемента.
///
/// Длина очереди никогда не превышает `capacity`. После [`BoundedQueue::close`]
/// новые элементы не принимаются, а уже лежащие в очереди выдаются до конца.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    label: String,
    capacity: usize,
    state: Mutex<QueueState<T>>,
    ready: Condvar,
    dropped: AtomicU64,
}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self::with_label("queue", capacity)
    }

    /// Очередь с меткой, которая попадает в логи при вытеснении.
    ///
    /// Нулевая ёмкость поднимается до 1.
    pub fn with_label(
        label: impl Into<String>,
        capacity: usize,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            label: label.into(),
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            ready: Condvar::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Добавляет элемент в хвост.
    ///
    /// Возвращает элемент, который в очереди не остался: вытесненный самый
    /// старый при переполнении или сам `item`, если очередь закрыта.
    pub fn push(
        &self,
        item: T,
    ) -> Option<T> {
        match self.try_push(item) {
            Ok(evicted) => evicted,
            Err(rejected) => Some(rejected),
        }
    }

    /// Как [`BoundedQueue::push`], но различает исходы.
    ///
    /// `Ok(evicted)` означает, что `item` принят; `Err(item)` означает, что
    /// очередь закрыта. Проверка и вставка выполняются под одной блокировкой,
    /// поэтому после `close` ни один элемент не попадёт в очередь.
    pub fn try_push(
        &self,
        item: T,
    ) -> Result<Option<T>, T> {
        let evicted = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(item);
            }
            let evicted = if state.items.len() >= self.capacity {
                state.items.pop_front()
            } else {
                None
            };
            state.items.push_back(item);
            evicted
        };

        if evicted.is_some() {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                queue = %self.label,
                capacity = self.capacity,
                dropped_total = total,
                "Queue is full, dropping oldest message"
            );
        }

        self.ready.notify_one();
        Ok(evicted)
    }

    /// Блокирует поток, пока в очереди не появится элемент.
    ///
    /// Возвращает `None`, только когда очередь закрыта и пуста.
    pub fn wait_and_pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.ready.wait(&mut state);
        }
    }

    /// Неблокирующее извлечение из головы.
    pub fn try_pop(&self) -> Option<T> {
        self.state.lock().items.pop_front()
    }

    /// Закрывает очередь и будит всех ожидающих потребителей.
    ///
    /// Содержимое не трогается. Возвращает `false`, если очередь уже была
    /// закрыта.
    pub fn close(&self) -> bool {
        let first = {
            let mut state = self.state.lock();
            !std::mem::replace(&mut state.closed, true)
        };
        self.ready.notify_all();
        first
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Текущая длина (снимок, только для диагностики).
    pub fn size(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Сколько элементов было вытеснено за всё время.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl<T> Default for BoundedQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
