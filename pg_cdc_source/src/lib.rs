pub mod codec;
pub mod enumerator;
pub mod offset;
pub mod split;
pub mod table;

// re-export tokio_postgres so collaborators can construct offsets and column
// types without depending on it directly
pub use tokio_postgres;
