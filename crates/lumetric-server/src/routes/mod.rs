pub mod collect;
pub mod health;
pub mod purchase;
pub mod retention;
pub mod stats;
