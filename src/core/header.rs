//! Inspection of stored transport header blocks.

/// Test whether a raw header block declares a `multipart/*` body.
///
/// Folded continuation lines are joined before matching.
pub fn declares_multipart(headers: &str) -> bool {
    let mut unfolded: Vec<String> = Vec::new();

    for line in headers.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = unfolded.last_mut() {
                last.push(' ');
                last.push_str(line.trim());
                continue;
            }
        }
        unfolded.push(line.to_string());
    }

    unfolded.iter().any(|header| {
        let Some((name, value)) = header.split_once(':') else {
            return false;
        };
        name.trim().eq_ignore_ascii_case("content-type")
            && value.trim_start().to_ascii_lowercase().starts_with("multipart/")
    })
}
