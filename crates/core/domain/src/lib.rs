pub mod connection;
pub mod data;
pub mod route;

pub use connection::{AckVerdict, ConnectionState};
pub use data::{FieldValue, Point, RawMessage, now_epoch_ns};
pub use route::{ExchangeKind, RouteRule};
