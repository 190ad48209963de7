pub mod logging;
pub mod temp_file;
