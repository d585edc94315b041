// Output module for dssh

pub mod errors;
pub mod terminal;

pub use errors::{DsshError, FormatError};
pub use terminal::{banner_line, format_table, terminal_width, TerminalOutput};
