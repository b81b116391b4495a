//! Utility modules for download engines.

mod ffmpeg_parser;
mod output_record_reader;

pub use ffmpeg_parser::{
    Estimate, OutputLine, ProgressTracker, is_progress_line, parse_duration_banner, parse_size,
    parse_speed, parse_time, parse_time_field,
};
pub use output_record_reader::OutputRecordReader;
