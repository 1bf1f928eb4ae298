const MAX_TITLE_CHARS: usize = 50;

/// Offline session title: the message itself, cut to 47 chars plus "..." when longer than 50.
pub fn generate_title(content: &str) -> String {
    if content.chars().count() <= MAX_TITLE_CHARS {
        return content.to_string();
    }
    let head: String = content.chars().take(MAX_TITLE_CHARS - 3).collect();
    format!("{head}...")
}
