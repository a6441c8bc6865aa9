use chrono::NaiveDate;

/// Parse an RFB `YYYYMMDD` date.
///
/// `Ok(None)` for the "no date" markers the files use (`0`, `00000000`, empty);
/// `Err` for anything else that is not a calendar date.
pub fn parse_rfb_date(s: &str) -> Result<Option<NaiveDate>, String> {
    let s = s.trim();
    if s.is_empty() || s.bytes().all(|b| b == b'0') {
        return Ok(None);
    }
    if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("`{s}` is not a YYYYMMDD date"));
    }
    NaiveDate::parse_from_str(s, "%Y%m%d")
        .map(Some)
        .map_err(|e| format!("`{s}` is not a calendar date: {e}"))
}
