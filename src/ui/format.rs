use time::OffsetDateTime;

/// Relative display form for feed timestamps.
pub fn format_timestamp(timestamp: OffsetDateTime) -> String {
    let seconds = (OffsetDateTime::now_utc() - timestamp).whole_seconds();
    if seconds < 60 {
        return "just now".to_string();
    }
    let minutes = seconds / 60;
    if minutes < 60 {
        return format!("{}m ago", minutes);
    }
    let hours = minutes / 60;
    if hours < 24 {
        return format!("{}h ago", hours);
    }
    let days = hours / 24;
    if days < 7 {
        return format!("{}d ago", days);
    }
    timestamp.date().to_string()
}
