use bytes::Bytes;

/// Сообщение: тема и непрозрачный payload.
///
/// Пустая тема недопустима: канал такое сообщение не принимает, а подписчик
/// не передаёт его обработчику.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
}

impl Message {
    pub fn new(
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Суммарный размер темы и payload в байтах.
    pub fn len(&self) -> usize {
        self.topic.len() + self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
