pub mod app;
pub mod auth;
pub mod cursor;
pub mod db;
pub mod db_ops;
pub mod error;
pub mod handlers;
pub mod ws;

pub use taskhub_models as models;
