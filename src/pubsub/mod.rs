//! Подсистема Publish–Subscribe.
//!
//! - `queue`: ограниченная FIFO-очередь с вытеснением самого старого.
//! - `message`: сообщение (тема, payload).
//! - `channel`: конвейер публикации одного канала с фоновым воркером.
//! - `registry`: реестр каналов с ленивым созданием и запуском relay.
//! - `listener`: фоновый приём по фильтрам тем с вызовом обработчика.

pub mod channel;
pub mod listener;
pub mod message;
pub mod queue;
pub mod registry;

// Публичный экспорт основных типов из вложенных модулей, чтобы упростить
// доступ к ним из внешнего кода.
pub use channel::*;
pub use listener::*;
pub use message::*;
pub use queue::*;
pub use registry::*;
