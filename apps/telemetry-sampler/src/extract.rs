/// Returns the last complete newline-terminated record in `chunk`.
///
/// A read that lands mid-stream usually ends with a partial line after the final
/// delimiter, so the record is the text between the last two newlines. With a single
/// newline the record is everything before it; with none the whole chunk is returned.
pub fn latest_record(chunk: &[u8]) -> &[u8] {
    let Some(last) = chunk.iter().rposition(|b| *b == b'\n') else {
        return chunk;
    };
    match chunk[..last].iter().rposition(|b| *b == b'\n') {
        Some(prev) => &chunk[prev + 1..last],
        None => &chunk[..last],
    }
}

/// Lossy text form of [`latest_record`]; the stream is ASCII but nothing upstream
/// guarantees it.
pub fn latest_value(chunk: &[u8]) -> String {
    String::from_utf8_lossy(latest_record(chunk)).into_owned()
}
