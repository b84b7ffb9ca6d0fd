pub mod turn;

pub use turn::{process_stream, ProcessedTurn, TurnContext};
