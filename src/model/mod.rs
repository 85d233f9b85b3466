pub mod exchange;
pub mod execution;
pub mod order;
pub mod position;
pub mod symbol;

pub use exchange::Exchange;
pub use execution::{LegResult, SliceResult, SlicedExecutionResult, TimeToFundingInfo};
pub use order::{
    ActiveOrder, LockHolder, OrderKey, OrderRequest, OrderStatus, OrderStatusReport, OrderType,
    Side, TimeInForce,
};
pub use position::{Position, PositionEntry, PositionExit, position_key};
pub use symbol::Symbol;
