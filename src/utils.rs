use std::path::PathBuf;

pub fn snapvault_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("snapvault"))
}

pub fn snapvault_data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("snapvault"))
}

pub fn u64_in_mib(num: u64) -> f64 {
    num as f64 / 1_024.0 / 1_024.0
}

/// Makes an opaque library identifier safe to use as a file name
///
/// Identifiers coming out of photo libraries regularly contain `/` (e.g.
/// `ABC123/L0/001`), which would otherwise splice directories into the remote
/// path.
pub fn sanitize_file_stem(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '-',
        })
        .collect()
}

/// Renders a transfer speed the way the status output wants it
pub fn format_speed(mib_per_sec: f64) -> String {
    format!("{mib_per_sec:.2} MiB/s")
}
