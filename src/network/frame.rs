//! Двухсегментный фрейм сообщения: `topic`, затем `payload`.
//!
//! Каждый сегмент кодируется как `[flags: u8][len: u32 BE][bytes]`.
//! Бит 0 во флагах (`MORE`) означает, что за сегментом следует ещё один.
//! У темы флаг `MORE` обязан быть выставлен, у payload обязан отсутствовать.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use relaybus_error::FrameError;

use crate::pubsub::Message;

/// Флаг "за этим сегментом следует ещё один".
pub const FLAG_MORE: u8 = 0x01;
/// Максимальная длина одного сегмента (16 MiB).
pub const MAX_SEGMENT_LEN: usize = 16 * 1024 * 1024;
/// Размер заголовка сегмента: флаги и длина.
pub const SEGMENT_HEADER_LEN: usize = 5;

/// Фрейм в сыром виде. Тема не обязана быть UTF-8: relay её не разбирает.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub topic: Bytes,
    pub payload: Bytes,
}

impl RawFrame {
    pub fn new(
        topic: impl Into<Bytes>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Длина фрейма в закодированном виде.
    pub fn encoded_len(&self) -> usize {
        encoded_len(self.topic.len(), self.payload.len())
    }

    pub fn encode(
        &self,
        dst: &mut BytesMut,
    ) -> Result<(), FrameError> {
        encode_frame(&self.topic, &self.payload, dst)
    }

    /// Кодирует фрейм в отдельный буфер.
    pub fn to_bytes(&self) -> Result<Bytes, FrameError> {
        let mut dst = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut dst)?;
        Ok(dst.freeze())
    }

    /// Совпадает ли тема с префиксом (побайтно).
    pub fn matches_prefix(
        &self,
        prefix: &str,
    ) -> bool {
        self.topic.starts_with(prefix.as_bytes())
    }

    /// Переводит фрейм в [`Message`]. Невалидные UTF-8 байты темы заменяются.
    pub fn into_message(self) -> Message {
        let topic = match String::from_utf8(self.topic.to_vec()) {
            Ok(topic) => topic,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        };
        Message {
            topic,
            payload: self.payload,
        }
    }
}

impl From<Message> for RawFrame {
    fn from(msg: Message) -> Self {
        Self {
            topic: Bytes::from(msg.topic.into_bytes()),
            payload: msg.payload,
        }
    }
}

pub fn encoded_len(
    topic_len: usize,
    payload_len: usize,
) -> usize {
    2 * SEGMENT_HEADER_LEN + topic_len + payload_len
}

/// Дописывает закодированный фрейм в конец `dst`.
pub fn encode_frame(
    topic: &[u8],
    payload: &[u8],
    dst: &mut BytesMut,
) -> Result<(), FrameError> {
    for segment in [topic, payload] {
        if segment.len() > MAX_SEGMENT_LEN {
            return Err(FrameError::SegmentTooLarge {
                size: segment.len(),
                max: MAX_SEGMENT_LEN,
            });
        }
    }

    dst.reserve(encoded_len(topic.len(), payload.len()));
    dst.put_u8(FLAG_MORE);
    dst.put_u32(topic.len() as u32);
    dst.put_slice(topic);
    dst.put_u8(0);
    dst.put_u32(payload.len() as u32);
    dst.put_slice(payload);
    Ok(())
}

/// Пытается извлечь один фрейм из начала `src`.
///
/// `Ok(None)` означает, что данных пока недостаточно; буфер при этом не
/// изменяется. Ошибка означает нарушение протокола, и соединение следует
/// закрыть.
pub fn decode_frame(src: &mut BytesMut) -> Result<Option<RawFrame>, FrameError> {
    let Some((topic_flags, topic_len)) = peek_segment_header(src, 0)? else {
        return Ok(None);
    };
    if topic_flags & FLAG_MORE == 0 {
        return Err(FrameError::MissingPayload);
    }

    let payload_at = SEGMENT_HEADER_LEN + topic_len;
    let Some((payload_flags, payload_len)) = peek_segment_header(src, payload_at)? else {
        return Ok(None);
    };
    if payload_flags & FLAG_MORE != 0 {
        return Err(FrameError::TrailingSegment);
    }

    let total = payload_at + SEGMENT_HEADER_LEN + payload_len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(SEGMENT_HEADER_LEN);
    let topic = src.split_to(topic_len).freeze();
    src.advance(SEGMENT_HEADER_LEN);
    let payload = src.split_to(payload_len).freeze();

    Ok(Some(RawFrame { topic, payload }))
}

/// Проверка буфера при закрытии соединения: остаток означает обрезанный фрейм.
pub fn check_eof(src: &BytesMut) -> Result<(), FrameError> {
    if src.is_empty() {
        Ok(())
    } else {
        Err(FrameError::Truncated { pending: src.len() })
    }
}

fn peek_segment_header(
    src: &[u8],
    at: usize,
) -> Result<Option<(u8, usize)>, FrameError> {
    if src.len() < at + SEGMENT_HEADER_LEN {
        return Ok(None);
    }

    let mut header = &src[at..at + SEGMENT_HEADER_LEN];
    let flags = header.get_u8();
    if flags & !FLAG_MORE != 0 {
        return Err(FrameError::UnknownFlags { flags });
    }

    let len = header.get_u32() as usize;
    if len > MAX_SEGMENT_LEN {
        return Err(FrameError::SegmentTooLarge {
            size: len,
            max: MAX_SEGMENT_LEN,
        });
    }

    Ok(Some((flags, len)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(
        topic: &str,
        payload: &[u8],
    ) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_frame(topic.as_bytes(), payload, &mut buf).unwrap();
        buf
    }

    /// Тест проверяет точную раскладку байтов на проводе.
    #[test]
    fn test_wire_layout() {
        let buf = encoded("ab", b"xyz");
        assert_eq!(
            &buf[..],
            &[0x01, 0, 0, 0, 2, b'a', b'b', 0x00, 0, 0, 0, 3, b'x', b'y', b'z']
        );
        assert_eq!(buf.len(), encoded_len(2, 3));
    }

    /// Тест проверяет, что неполный ввод даёт "нужно больше данных" и не
    /// портит буфер, а после дочитывания фрейм собирается.
    #[test]
    fn test_partial_input_needs_more() {
        let full = encoded("cam1", b"hello");

        for cut in 0..full.len() {
            let mut partial = BytesMut::from(&full[..cut]);
            assert_eq!(decode_frame(&mut partial), Ok(None), "cut at {cut}");
            assert_eq!(partial.len(), cut);

            partial.extend_from_slice(&full[cut..]);
            let frame = decode_frame(&mut partial).unwrap().unwrap();
            assert_eq!(&frame.topic[..], b"cam1");
            assert_eq!(&frame.payload[..], b"hello");
            assert!(partial.is_empty());
        }
    }

    /// Тест проверяет разбор нескольких фреймов подряд из одного буфера.
    #[test]
    fn test_back_to_back_frames() {
        let mut buf = encoded("a", b"1");
        buf.extend_from_slice(&encoded("b", b"22"));

        let first = decode_frame(&mut buf).unwrap().unwrap();
        let second = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(first, RawFrame::new(&b"a"[..], &b"1"[..]));
        assert_eq!(second, RawFrame::new(&b"b"[..], &b"22"[..]));
        assert_eq!(decode_frame(&mut buf), Ok(None));
    }

    /// Тест проверяет ошибки протокола.
    #[test]
    fn test_protocol_violations() {
        // тема без MORE
        let mut buf = BytesMut::from(&[0x00, 0, 0, 0, 1, b'a'][..]);
        assert_eq!(decode_frame(&mut buf), Err(FrameError::MissingPayload));

        // payload с MORE
        let mut buf = BytesMut::from(&[0x01, 0, 0, 0, 1, b'a', 0x01, 0, 0, 0, 0][..]);
        assert_eq!(decode_frame(&mut buf), Err(FrameError::TrailingSegment));

        // неизвестные флаги
        let mut buf = BytesMut::from(&[0x81, 0, 0, 0, 0][..]);
        assert_eq!(
            decode_frame(&mut buf),
            Err(FrameError::UnknownFlags { flags: 0x81 })
        );

        // заявленная длина больше лимита
        let mut buf = BytesMut::new();
        buf.put_u8(FLAG_MORE);
        buf.put_u32((MAX_SEGMENT_LEN + 1) as u32);
        assert!(matches!(
            decode_frame(&mut buf),
            Err(FrameError::SegmentTooLarge { .. })
        ));
    }

    /// Тест проверяет, что слишком большой сегмент не кодируется.
    #[test]
    fn test_encode_rejects_oversized_segment() {
        let big = vec![0u8; MAX_SEGMENT_LEN + 1];
        let mut buf = BytesMut::new();
        let err = encode_frame(b"t", &big, &mut buf).unwrap_err();
        assert!(matches!(err, FrameError::SegmentTooLarge { .. }));
        assert!(buf.is_empty());
    }

    /// Тест проверяет, что повторное кодирование разобранного фрейма даёт
    /// исходные байты.
    #[test]
    fn test_reencode_is_byte_identical() {
        let original = encoded("cam2/left", &[0, 1, 2, 254, 255]);
        let mut buf = original.clone();
        let frame = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.to_bytes().unwrap(), original.freeze());
    }

    #[test]
    fn test_check_eof() {
        assert!(check_eof(&BytesMut::new()).is_ok());
        let buf = BytesMut::from(&[0x01, 0, 0][..]);
        assert_eq!(check_eof(&buf), Err(FrameError::Truncated { pending: 3 }));
    }

    #[test]
    fn test_into_message_and_prefix() {
        let frame = RawFrame::new(&b"cam1/raw"[..], &b"px"[..]);
        assert!(frame.matches_prefix("cam1"));
        assert!(frame.matches_prefix(""));
        assert!(!frame.matches_prefix("cam2"));

        let msg = frame.into_message();
        assert_eq!(msg.topic, "cam1/raw");
        assert_eq!(&msg.payload[..], b"px");
    }
}
