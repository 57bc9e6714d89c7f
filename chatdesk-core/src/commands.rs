// ABOUTME: Chat text to Command parsing with per-line configurable prefixes
// ABOUTME: Handles quoted arguments and distinguishes commands from conversation content

/// A parsed chat command: verb plus arguments. Transient — it lives only
/// for the duration of one processing pass and is never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// The verb (without prefix), lowercased.
    pub name: String,
    /// Parsed arguments (quoted strings kept whole).
    pub args: Vec<String>,
    /// The raw argument string after the verb, untouched. `br-cmd` relays
    /// this verbatim.
    pub raw_args: String,
}

impl Command {
    pub fn new(name: impl Into<String>, args: Vec<String>, raw_args: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args,
            raw_args: raw_args.into(),
        }
    }

    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(|s| s.as_str())
    }

    /// Arguments from `index` on, rejoined — used for free-text tails like
    /// pause reasons and descriptions.
    pub fn rest(&self, index: usize) -> Option<String> {
        if self.args.len() > index {
            Some(self.args[index..].join(" "))
        } else {
            None
        }
    }
}

/// Result of looking at one message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult {
    /// Addressed to the bot and parsed.
    Command(Command),
    /// Ordinary conversation content, passed through untouched.
    Message(String),
    /// Nothing to do (empty body).
    Ignore,
}

impl ParseResult {
    pub fn as_command(&self) -> Option<&Command> {
        match self {
            ParseResult::Command(cmd) => Some(cmd),
            _ => None,
        }
    }
}

/// Parse a message against the prefix configured for its line's bridge
/// (e.g. `acd`, `!wa`). Only messages that start with the prefix followed
/// by whitespace are commands; everything else is conversation content.
pub fn parse_message(body: &str, prefix: &str) -> ParseResult {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return ParseResult::Ignore;
    }

    let prefix = prefix.trim();
    if prefix.is_empty() || !starts_with_prefix(trimmed, prefix) {
        return ParseResult::Message(trimmed.to_string());
    }

    let remainder = trimmed[prefix.len()..].trim();
    if remainder.is_empty() {
        // Bare prefix: treat as a help request.
        return ParseResult::Command(Command::new("help", Vec::new(), ""));
    }

    let parts: Vec<&str> = remainder.splitn(2, char::is_whitespace).collect();
    let name = parts[0].to_lowercase();
    let raw_args = parts.get(1).map(|s| s.trim()).unwrap_or("").to_string();
    let args = parse_args(&raw_args);
    ParseResult::Command(Command::new(name, args, raw_args))
}

/// Case-insensitive prefix match that requires a word boundary after it,
/// so a prefix of `acd` does not swallow a message starting with "acdc".
fn starts_with_prefix(text: &str, prefix: &str) -> bool {
    // `get` refuses slices that are too short or that would land inside a
    // multi-byte character, so arbitrary chat text never panics here.
    let Some(head) = text.get(..prefix.len()) else {
        return false;
    };
    if !head.eq_ignore_ascii_case(prefix) {
        return false;
    }
    text[prefix.len()..]
        .chars()
        .next()
        .map_or(true, char::is_whitespace)
}

/// Split arguments, respecting single and double quotes.
fn parse_args(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut quote_char = '"';

    for c in input.chars() {
        match c {
            '"' | '\'' if !in_quotes => {
                in_quotes = true;
                quote_char = c;
            }
            c if c == quote_char && in_quotes => {
                in_quotes = false;
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            ' ' | '\t' if !in_quotes => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_conversation_content() {
        let result = parse_message("hola, necesito ayuda", "acd");
        assert!(matches!(result, ParseResult::Message(_)));
    }

    #[test]
    fn multibyte_text_is_conversation_content() {
        // Byte 3 of "ayúdame" falls inside the 'ú'.
        assert!(matches!(
            parse_message("ayúdame por favor", "acd"),
            ParseResult::Message(_)
        ));
        // Here the prefix-length boundary lands inside 'ñ'.
        assert!(matches!(
            parse_message("acñ hola", "acd"),
            ParseResult::Message(_)
        ));
        assert!(matches!(parse_message("é", "acd"), ParseResult::Message(_)));
    }

    #[test]
    fn prefixed_text_is_a_command() {
        let result = parse_message("acd queue create sales", "acd");
        let cmd = result.as_command().unwrap();
        assert_eq!(cmd.name, "queue");
        assert_eq!(cmd.args, vec!["create", "sales"]);
        assert_eq!(cmd.raw_args, "create sales");
    }

    #[test]
    fn prefix_match_is_case_insensitive_with_word_boundary() {
        assert!(parse_message("ACD login", "acd").as_command().is_some());
        // "acdc" must not be treated as the prefix.
        assert!(matches!(
            parse_message("acdc rocks", "acd"),
            ParseResult::Message(_)
        ));
    }

    #[test]
    fn bare_prefix_asks_for_help() {
        let cmd = parse_message("acd", "acd").as_command().unwrap().clone();
        assert_eq!(cmd.name, "help");
    }

    #[test]
    fn quoted_arguments_stay_whole() {
        let result = parse_message("!wa queue create sales \"Ventas LATAM\"", "!wa");
        let cmd = result.as_command().unwrap();
        assert_eq!(cmd.args, vec!["create", "sales", "Ventas LATAM"]);
    }

    #[test]
    fn raw_args_preserved_for_bridge_passthrough() {
        let result = parse_message("acd br-cmd login --phone 573001112233", "acd");
        let cmd = result.as_command().unwrap();
        assert_eq!(cmd.name, "br-cmd");
        assert_eq!(cmd.raw_args, "login --phone 573001112233");
    }

    #[test]
    fn empty_messages_are_ignored() {
        assert!(matches!(parse_message("   ", "acd"), ParseResult::Ignore));
    }

    #[test]
    fn rest_joins_free_text_tails() {
        let cmd = parse_message("acd queue pause sales a1 back after lunch", "acd")
            .as_command()
            .unwrap()
            .clone();
        assert_eq!(cmd.rest(3).as_deref(), Some("back after lunch"));
        assert_eq!(cmd.rest(9), None);
    }
}
