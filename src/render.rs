// ABOUTME: Text helpers for Matrix message formatting
// ABOUTME: Markdown-to-HTML conversion and long reply chunking

use pulldown_cmark::{html, Parser};

/// Convert markdown to HTML for Matrix message formatting
pub fn markdown_to_html(markdown: &str) -> String {
    let parser = Parser::new(markdown);
    let mut html_output = String::new();
    html::push_html(&mut html_output, parser);
    html_output
}

/// Split long text into chunks, trying to break at line boundaries
pub fn chunk_message(text: &str, max_chars: usize) -> Vec<String> {
    if text.len() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();

    for line in text.lines() {
        if !current.is_empty() && current.len() + line.len() + 1 > max_chars {
            chunks.push(current.trim_end().to_string());
            current = String::new();
        }
        if line.len() > max_chars {
            // A single over-long line splits at word boundaries.
            let mut part = String::new();
            for word in line.split_whitespace() {
                if !part.is_empty() && part.len() + word.len() + 1 > max_chars {
                    chunks.push(std::mem::take(&mut part));
                }
                if !part.is_empty() {
                    part.push(' ');
                }
                part.push_str(word);
            }
            current = part;
            current.push('\n');
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    if !current.trim().is_empty() {
        chunks.push(current.trim_end().to_string());
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markdown_renders_inline_code() {
        let html = markdown_to_html("Queue `sales` created");
        assert!(html.contains("<code>sales</code>"));
    }

    #[test]
    fn short_messages_are_one_chunk() {
        assert_eq!(chunk_message("hello", 100), vec!["hello"]);
    }

    #[test]
    fn long_messages_split_at_lines() {
        let text = "line one\nline two\nline three";
        let chunks = chunk_message(text, 12);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], "line one");
    }

    #[test]
    fn overlong_single_lines_split_at_words() {
        let text = "uno dos tres cuatro cinco";
        let chunks = chunk_message(text, 10);
        assert!(chunks.iter().all(|c| c.len() <= 10), "got: {chunks:?}");
        assert_eq!(chunks.join(" "), text);
    }
}
