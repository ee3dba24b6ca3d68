pub mod error;
pub mod models;
pub mod observable;
pub mod settings;
