//! The `__DATE__` and `__TIME__` spellings.

use chrono::{DateTime, Utc};

/// Format the current date as "Mmm dd yyyy" for __DATE__
pub fn format_date() -> String {
    date_text(&Utc::now())
}

/// Format the current time as "hh:mm:ss" (UTC) for __TIME__
pub fn format_time() -> String {
    time_text(&Utc::now())
}

fn date_text(now: &DateTime<Utc>) -> String {
    // Single-digit days are space-padded, the way compilers spell it.
    now.format("%b %e %Y").to_string()
}

fn time_text(now: &DateTime<Utc>) -> String {
    now.format("%H:%M:%S").to_string()
}
