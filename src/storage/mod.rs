mod db;

pub use db::{default_data_dir, Store};
