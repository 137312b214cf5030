pub mod connection;
pub mod room;

pub use room::Room;
