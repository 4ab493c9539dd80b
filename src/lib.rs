pub mod bandwidth;
pub mod board;
pub mod command;
pub mod command_list;
pub mod config;
pub mod data_block;
pub mod error;
pub mod registers;
pub mod transport;
pub mod utils;
pub mod writer;

pub use board::*;
pub use command::*;
pub use command_list::*;
pub use config::*;
pub use data_block::*;
pub use error::*;
pub use registers::*;
pub use transport::*;
pub use utils::*;
pub use writer::*;
