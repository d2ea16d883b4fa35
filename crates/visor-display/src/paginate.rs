//! Text pagination for the constrained display. Long replies are cut at
//! word boundaries into fixed-size pages; each split at a space consumes
//! exactly that one space, so rejoining pages with single spaces
//! reproduces the input.

/// Maximum characters per page.
pub const CHUNK_SIZE: usize = 250;

/// A word boundary earlier than this would leave an uselessly short
/// page; below it the cut is hard at `CHUNK_SIZE`.
const MIN_CHUNK: usize = 100;

/// Split text into display-sized chunks at word boundaries.
pub fn split_text(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= CHUNK_SIZE {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut rest: &[char] = &chars;
    loop {
        if rest.len() <= CHUNK_SIZE {
            chunks.push(rest.iter().collect());
            break;
        }
        // Last space at or before the boundary (inclusive).
        let window = &rest[..=CHUNK_SIZE];
        match window.iter().rposition(|c| *c == ' ') {
            Some(cut) if cut >= MIN_CHUNK => {
                chunks.push(rest[..cut].iter().collect());
                rest = &rest[cut + 1..]; // the boundary space itself
            }
            _ => {
                chunks.push(rest[..CHUNK_SIZE].iter().collect());
                rest = &rest[CHUNK_SIZE..];
            }
        }
        if rest.is_empty() {
            break;
        }
    }
    chunks
}

/// Split and label pages `[i/n] `. A single page carries no label.
pub fn paginate(text: &str) -> Vec<String> {
    let chunks = split_text(text);
    let total = chunks.len();
    if total <= 1 {
        return chunks;
    }
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| format!("[{}/{}] {}", i + 1, total, chunk))
        .collect()
}
