pub mod output_buffer;
pub mod terminal_tool;
