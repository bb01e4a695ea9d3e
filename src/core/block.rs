//! Block numbering derived from the `block/<n>.md` marker files of a project.

use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use tracing::warn;

pub const BLOCK_DIR: &str = "block";
pub const BLOCK_EXTENSION: &str = "md";

static COMPLETION_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Status:\s*(COMPLETED|CLOSED|DONE)").expect("static regex")
});

/// Current block of the project at `work_dir`.
///
/// No marker storage means block 0. Otherwise the highest numbered marker wins,
/// and a marker flagged done moves the project on to the next number. Read
/// failures degrade to the best number known so far.
pub fn current_block(work_dir: &Path) -> u64 {
    let block_dir = work_dir.join(BLOCK_DIR);
    if !block_dir.is_dir() {
        return 0;
    }

    let entries = match std::fs::read_dir(&block_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot read block folder {:?}: {}", block_dir, e);
            return 0;
        }
    };

    let Some(last) = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| parse_block_file_name(&entry.file_name().to_string_lossy()))
        .max()
    else {
        return 0;
    };

    let marker = block_dir.join(format!("{}.{}", last, BLOCK_EXTENSION));
    match std::fs::read_to_string(&marker) {
        Ok(content) if is_completion_marked(&content) => last + 1,
        Ok(_) => last,
        Err(e) => {
            warn!("Cannot read block marker {:?}: {}", marker, e);
            last
        }
    }
}

/// Whether block `block_id` of the project is flagged done. Block 0 never is.
pub fn is_block_completed(work_dir: &Path, block_id: u64) -> bool {
    if block_id == 0 {
        return false;
    }
    let marker = work_dir
        .join(BLOCK_DIR)
        .join(format!("{}.{}", block_id, BLOCK_EXTENSION));
    std::fs::read_to_string(marker)
        .map(|content| is_completion_marked(&content))
        .unwrap_or(false)
}

pub fn is_completion_marked(content: &str) -> bool {
    COMPLETION_MARKER.is_match(content)
}

/// `"12.md"` -> `Some(12)`; anything else (`"12.txt"`, `"a.md"`, `"1.2.md"`) is ignored.
fn parse_block_file_name(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(&format!(".{}", BLOCK_EXTENSION))?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}
