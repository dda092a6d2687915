//! Order execution: the idempotent executor, the local order book, and the
//! broker reconciler.

mod executor;
mod order_book;
mod reconciler;

pub use executor::{make_coid, minute_bucket, IdempotentExecutor};
pub use order_book::{OrderBook, OrderBookError, OrderRecord, OrderStatus};
pub use reconciler::{wait_for_fill, Reconciler};
