//! Services separating file handling from inference logic

pub mod io;

pub use io::{output_path_for, ImageIo};
