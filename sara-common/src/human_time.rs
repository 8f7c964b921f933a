//! Human-readable time formatting
//!
//! Consistent time display for logs, announcements, and the CLI. Short
//! values read as plain seconds, track-scale values as M:SS, and anything
//! longer as H:MM:SS, so a segue at 150 s logs as `2:30.0` rather than a
//! raw float.

/// Values below this format as plain seconds
const SHORT_FORMAT_MAX: f64 = 100.0;

/// Values below this format as M:SS.X
const MEDIUM_FORMAT_MAX: f64 = 6000.0;

/// Format a duration in seconds for human consumption.
///
/// # Examples
///
/// ```
/// use sara_common::human_time::format_seconds;
///
/// assert_eq!(format_seconds(4.5), "4.50s");
/// assert_eq!(format_seconds(150.0), "2:30.0");
/// assert_eq!(format_seconds(3661.0), "1:01:01");
/// ```
pub fn format_seconds(seconds: f64) -> String {
    let negative = seconds < 0.0;
    let abs = seconds.abs();

    let formatted = if abs < SHORT_FORMAT_MAX {
        format!("{:.2}s", abs)
    } else if abs < MEDIUM_FORMAT_MAX {
        let minutes = (abs / 60.0).floor() as u64;
        let secs = abs - minutes as f64 * 60.0;
        format!("{}:{:04.1}", minutes, secs)
    } else {
        let total = abs.round() as u64;
        let hours = total / 3600;
        let minutes = (total % 3600) / 60;
        let secs = total % 60;
        format!("{}:{:02}:{:02}", hours, minutes, secs)
    };

    if negative {
        format!("-{}", formatted)
    } else {
        formatted
    }
}

/// Format a countdown for spoken announcements: whole seconds, rounded up
/// so "ends in 3 seconds" never reads zero while audio remains.
pub fn format_countdown(seconds: f64) -> String {
    let whole = seconds.max(0.0).ceil() as u64;
    if whole == 1 {
        "1 second".to_string()
    } else {
        format!("{} seconds", whole)
    }
}
