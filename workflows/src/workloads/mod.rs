pub mod chaos;
pub mod transaction;
