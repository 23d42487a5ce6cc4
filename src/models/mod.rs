pub mod balance;
pub mod order;
pub mod position;
pub mod symbol;

pub use balance::*;
pub use order::*;
pub use position::*;
pub use symbol::*;
