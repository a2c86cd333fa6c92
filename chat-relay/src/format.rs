//! Rendering of the lines that travel over the wire.

const SMILEY: &str = "\u{1F60A}";
const FROWN: &str = "\u{2639}";
const HEART: &str = "\u{2764}";

/// Replaces the text emoticons `:)`, `:(` and `<3` with their glyphs.
///
/// The glyphs are not ASCII, so one pass can never create a new emoticon and
/// the substitution is applied exactly once per token.
pub fn format_message(text: &str) -> String {
    text.replace(":)", SMILEY)
        .replace(":(", FROWN)
        .replace("<3", HEART)
}

pub fn chat_line(name: &str, text: &str) -> String {
    format!("[{name}] {text}")
}

pub fn joined_line(name: &str) -> String {
    format!("[{name}] Entered the chat.")
}

pub fn left_line(name: &str) -> String {
    format!("[{name}] Left the chat.")
}

pub fn server_line(text: &str) -> String {
    format!("[Server]: {text}")
}
