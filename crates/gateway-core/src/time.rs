use chrono::{Local, Utc};

/// RFC3339 UTC timestamp for `updated_at`/`created_at` stamps.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Builds the transient time preamble prepended to every turn's system
/// prompt (spec §4.1 step 3). Never persisted — composed fresh per request.
///
/// `timezone` is the session's display timezone label (e.g. `"America/Denver"`);
/// it is surfaced verbatim to the model alongside the server's local clock,
/// since converting to an arbitrary IANA zone is outside this crate's
/// dependency footprint.
pub fn compose_time_preamble(timezone: Option<&str>) -> String {
    let local = Local::now();
    let utc = Utc::now();
    let tz_label = timezone.unwrap_or("unspecified");

    format!(
        "Current date: {date} ({weekday}). Current local time: {time} (timezone: {tz}). \
         Current UTC instant: {utc}. Use this for any relative-time reasoning \
         (e.g. \"tomorrow\", \"in two hours\").",
        date = local.format("%Y-%m-%d"),
        weekday = local.format("%A"),
        time = local.format("%H:%M:%S"),
        tz = tz_label,
        utc = utc.to_rfc3339(),
    )
}

/// Combines the time preamble with the configured persistent system prompt,
/// if any. The result is the transient system message sent to the provider.
pub fn compose_system_message(timezone: Option<&str>, persistent_prompt: Option<&str>) -> String {
    let preamble = compose_time_preamble(timezone);
    match persistent_prompt {
        Some(p) if !p.trim().is_empty() => format!("{preamble}\n\n{p}"),
        _ => preamble,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preamble_contains_utc_instant_and_tz_label() {
        let preamble = compose_time_preamble(Some("America/Denver"));
        assert!(preamble.contains("America/Denver"));
        assert!(preamble.contains("UTC"));
    }

    #[test]
    fn system_message_appends_persistent_prompt() {
        let msg = compose_system_message(None, Some("Be concise."));
        assert!(msg.ends_with("Be concise."));
    }

    #[test]
    fn system_message_without_persistent_prompt_is_just_preamble() {
        let preamble = compose_time_preamble(None);
        let msg = compose_system_message(None, None);
        assert_eq!(msg, preamble);
    }
}
