//! Context assembly: ranked search results → one prompt-ready string.
//!
//! Each result becomes a labelled block, `[Source N: <title>]` followed by
//! its content, numbered from 1 in ranking order. Blocks are separated by
//! [`SOURCE_SEPARATOR`]. No results yields the empty string, which is what
//! tells prompt construction to fall back to the no-context instructions.

use crate::models::SearchResult;

/// Delimiter placed between source blocks.
pub const SOURCE_SEPARATOR: &str = "\n\n---\n\n";

/// Renders every result, in order.
pub fn build_context(results: &[SearchResult]) -> String {
    results
        .iter()
        .enumerate()
        .map(|(i, r)| render_source(i + 1, r))
        .collect::<Vec<_>>()
        .join(SOURCE_SEPARATOR)
}

/// Like [`build_context`], but stops adding whole sources once the next
/// one would push the output past `max_chars`. The first source is always
/// included.
pub fn build_context_bounded(results: &[SearchResult], max_chars: usize) -> String {
    let mut text = String::new();
    for (i, result) in results.iter().enumerate() {
        let block = render_source(i + 1, result);
        if i > 0 {
            let projected = text.chars().count()
                + SOURCE_SEPARATOR.chars().count()
                + block.chars().count();
            if projected > max_chars {
                break;
            }
            text.push_str(SOURCE_SEPARATOR);
        }
        text.push_str(&block);
    }
    text
}

fn render_source(n: usize, result: &SearchResult) -> String {
    let title = result.metadata.title.trim();
    if title.is_empty() {
        format!("[Source {}]\n{}", n, result.content)
    } else {
        format!("[Source {}: {}]\n{}", n, title, result.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkMetadata;

    fn result(title: &str, content: &str) -> SearchResult {
        SearchResult {
            id: title.to_string(),
            content: content.to_string(),
            metadata: ChunkMetadata {
                file: "f.md".into(),
                section: String::new(),
                title: title.to_string(),
            },
            similarity: 0.9,
        }
    }

    #[test]
    fn empty_results_give_empty_context() {
        assert_eq!(build_context(&[]), "");
        assert_eq!(build_context_bounded(&[], 100), "");
    }

    #[test]
    fn sources_are_numbered_and_separated() {
        let ctx = build_context(&[result("A", "alpha"), result("B", "beta")]);
        assert_eq!(ctx, "[Source 1: A]\nalpha\n\n---\n\n[Source 2: B]\nbeta");
    }

    #[test]
    fn untitled_sources_omit_the_label() {
        let ctx = build_context(&[result("", "body")]);
        assert_eq!(ctx, "[Source 1]\nbody");
    }

    #[test]
    fn bounded_context_keeps_whole_sources() {
        let results = [result("A", "alpha"), result("B", "beta"), result("C", "gamma")];
        let full = build_context(&results);
        assert_eq!(build_context_bounded(&results, full.len()), full);

        let one = build_context_bounded(&results, 20);
        assert_eq!(one, "[Source 1: A]\nalpha");

        let first_only = build_context_bounded(&results, 0);
        assert_eq!(first_only, "[Source 1: A]\nalpha");
    }
}
