//! Сетевой уровень relaybus.
//!
//! ## Подмодули
//!
//! - `transport`: трейты `Publisher`, `Subscriber`, `Transport` и опции
//!   сокетов.
//! - `frame`: двухсегментный фрейм (topic, payload) на проводе.
//! - `tcp`: блокирующий TCP-транспорт с переподключением.
//! - `memory`: внутрипроцессный транспорт для тестов.
//! - `relay`: точка пересылки publisher'ы → subscriber'ы.

pub mod frame;
pub mod memory;
pub mod relay;
pub mod tcp;
pub mod transport;

// Публичный экспорт основных типов из вложенных модулей, чтобы упростить
// доступ к ним из внешнего кода.
pub use frame::{decode_frame, encode_frame, RawFrame, FLAG_MORE, MAX_SEGMENT_LEN};
pub use memory::MemoryHub;
pub use relay::{Relay, RelayConfig, RelayStats, DEFAULT_BACKEND_BIND, DEFAULT_FRONTEND_BIND};
pub use tcp::{TcpPublisher, TcpSubscriber, TcpTransport};
pub use transport::*;
