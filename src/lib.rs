pub mod app;
pub mod shutdown;
pub mod subsystems;
