//! Reading experiment output: the latest progress line and experiment ids.

const CURSOR_UP: &str = "\x1b[A";
const ID_ANNOUNCEMENT: &str = "Started run with ID ";

/// The line a terminal would show last for this output.
///
/// Progress bars redraw with `\r` and validation bars move the cursor up
/// with `ESC[A`; both are folded away. `None` if nothing printable is left.
pub fn extract_last_line(output: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(output);
    let text = text.trim_end();
    let start = text.rfind(['\r', '\n']).map(|i| i + 1).unwrap_or(0);
    let line = text[start..].replace(CURSOR_UP, "");
    let line = line.trim();
    if line.is_empty() {
        None
    } else {
        Some(line.to_string())
    }
}

/// Experiment id announced by `line`, as in `Started run with ID "7160"`.
pub fn extract_experiment_id(line: &str) -> Option<u64> {
    let (_, rest) = line.split_once(ID_ANNOUNCEMENT)?;
    let quoted = rest.strip_prefix('"')?;
    let (number, _) = quoted.split_once('"')?;
    number.parse().ok()
}

/// The most recent experiment id announced anywhere in `output`.
pub fn latest_experiment_id(output: &[u8]) -> Option<u64> {
    String::from_utf8_lossy(output)
        .lines()
        .rev()
        .find_map(extract_experiment_id)
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
