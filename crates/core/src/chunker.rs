//! Chunker (spec §4.4): splits a document into ordered, structure-aware
//! chunks with symbol metadata, using one of three strategies chosen by the
//! owning store version's config.
//!
//! Structural chunking walks a tree-sitter parse tree the way
//! `AlrikOlson-codescope`'s `ast.rs` extracts symbols, but emits chunk spans
//! instead of a flat symbol index: every top-level symbol becomes (at least)
//! one chunk, and the text between/around symbols is covered by filler
//! chunks so no byte range is ever dropped.

use crate::config::ChunkingStrategy;
use crate::document::{Chunk, Document};

#[cfg(feature = "treesitter")]
use tree_sitter::{Language, Node, Parser};

struct SymbolSpan {
    name: String,
    start_line: usize,
    end_line: usize,
}

pub fn chunk_document(
    doc: &Document,
    doc_hash: &str,
    strategy: ChunkingStrategy,
    max_chunk_lines: usize,
    overlap_lines: usize,
) -> Vec<Chunk> {
    match strategy {
        ChunkingStrategy::Structural => {
            #[cfg(feature = "treesitter")]
            {
                if let Some(spans) = structural_spans(doc) {
                    return build_chunks_from_spans(doc, doc_hash, &spans, max_chunk_lines, overlap_lines);
                }
            }
            fixed_line_chunks(doc, doc_hash, max_chunk_lines, overlap_lines)
        }
        ChunkingStrategy::FixedLine => fixed_line_chunks(doc, doc_hash, max_chunk_lines, overlap_lines),
        ChunkingStrategy::ByteWindow => byte_window_chunks(doc, doc_hash, max_chunk_lines * 80, overlap_lines * 80),
    }
}

#[cfg(feature = "treesitter")]
fn language_for_ext(ext: &str) -> Option<Language> {
    match ext {
        "rs" => Some(tree_sitter_rust::LANGUAGE.into()),
        "ts" | "tsx" => Some(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
        "js" | "jsx" | "mjs" | "cjs" => Some(tree_sitter_javascript::LANGUAGE.into()),
        "py" | "pyi" => Some(tree_sitter_python::LANGUAGE.into()),
        "go" => Some(tree_sitter_go::LANGUAGE.into()),
        "c" | "h" => Some(tree_sitter_c::LANGUAGE.into()),
        "cpp" | "cc" | "cxx" | "hpp" | "hh" | "hxx" => Some(tree_sitter_cpp::LANGUAGE.into()),
        "java" => Some(tree_sitter_java::LANGUAGE.into()),
        _ => None,
    }
}

#[cfg(feature = "treesitter")]
fn classify_node(kind: &str) -> bool {
    matches!(
        kind,
        "function_item"
            | "struct_item"
            | "enum_item"
            | "trait_item"
            | "impl_item"
            | "function_declaration"
            | "class_declaration"
            | "interface_declaration"
            | "method_definition"
            | "function_definition"
            | "class_definition"
            | "method_declaration"
            | "struct_specifier"
            | "enum_specifier"
            | "class_specifier"
            | "enum_declaration"
    )
}

#[cfg(feature = "treesitter")]
fn extract_name(node: &Node, source: &[u8]) -> Option<String> {
    for field in ["name", "type"] {
        if let Some(name_node) = node.child_by_field_name(field) {
            if let Ok(text) = name_node.utf8_text(source) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    return Some(trimmed.to_string());
                }
            }
        }
    }
    None
}

#[cfg(feature = "treesitter")]
fn walk_top_level(node: Node, source: &[u8], spans: &mut Vec<SymbolSpan>) {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if classify_node(child.kind()) {
            let name = extract_name(&child, source).unwrap_or_else(|| child.kind().to_string());
            spans.push(SymbolSpan {
                name,
                start_line: child.start_position().row + 1,
                end_line: child.end_position().row + 1,
            });
        } else {
            walk_top_level(child, source, spans);
        }
    }
}

#[cfg(feature = "treesitter")]
fn structural_spans(doc: &Document) -> Option<Vec<SymbolSpan>> {
    let ext = doc.path.rsplit('.').next()?;
    let language = language_for_ext(ext)?;
    let mut parser = Parser::new();
    parser.set_language(&language).ok()?;
    let tree = parser.parse(&doc.content, None)?;
    let mut spans = Vec::new();
    walk_top_level(tree.root_node(), doc.content.as_bytes(), &mut spans);
    spans.sort_by_key(|s| s.start_line);
    Some(spans)
}

fn line_count(content: &str) -> usize {
    content.lines().count().max(1)
}

fn byte_offset_of_line(content: &str, line_one_based: usize) -> usize {
    if line_one_based <= 1 {
        return 0;
    }
    content
        .match_indices('\n')
        .nth(line_one_based - 2)
        .map(|(i, _)| i + 1)
        .unwrap_or(content.len())
}

fn slice_lines(content: &str, start_line: usize, end_line: usize) -> (String, usize, usize) {
    let start_byte = byte_offset_of_line(content, start_line);
    let end_byte = if end_line >= line_count(content) {
        content.len()
    } else {
        byte_offset_of_line(content, end_line + 1).saturating_sub(1).max(start_byte)
    };
    let end_byte = end_byte.min(content.len());
    (content[start_byte..end_byte].to_string(), start_byte, end_byte)
}

fn make_chunk(doc: &Document, doc_hash: &str, start_line: usize, end_line: usize, symbols: Vec<String>) -> Chunk {
    let (text, start_byte, end_byte) = slice_lines(&doc.content, start_line, end_line);
    let chunk_hash = crate::document::content_hash(&text);
    Chunk {
        chunk_id: Chunk::derive_id(doc_hash, start_line, end_line),
        doc_hash: doc_hash.to_string(),
        path: doc.path.clone(),
        language: doc.language.clone(),
        start_line,
        end_line,
        start_byte,
        end_byte,
        text,
        symbols,
        chunk_hash,
        extra: Default::default(),
    }
}

/// Splits an oversized span into fixed-line sub-chunks with overlap,
/// reusing the line window logic shared with pure fixed-line chunking.
fn split_oversized(
    doc: &Document,
    doc_hash: &str,
    start_line: usize,
    end_line: usize,
    symbols: Vec<String>,
    max_chunk_lines: usize,
    overlap_lines: usize,
) -> Vec<Chunk> {
    let mut out = Vec::new();
    let mut cursor = start_line;
    let step = max_chunk_lines.saturating_sub(overlap_lines).max(1);
    while cursor <= end_line {
        let window_end = (cursor + max_chunk_lines - 1).min(end_line);
        out.push(make_chunk(doc, doc_hash, cursor, window_end, symbols.clone()));
        if window_end >= end_line {
            break;
        }
        cursor += step;
    }
    out
}

fn build_chunks_from_spans(
    doc: &Document,
    doc_hash: &str,
    spans: &[SymbolSpan],
    max_chunk_lines: usize,
    overlap_lines: usize,
) -> Vec<Chunk> {
    let total_lines = line_count(&doc.content);
    if spans.is_empty() {
        return fixed_line_chunks(doc, doc_hash, max_chunk_lines, overlap_lines);
    }
    let mut chunks = Vec::new();
    let mut cursor = 1usize;

    for span in spans {
        if span.start_line > cursor {
            // Filler region before this symbol.
            chunks.extend(split_oversized(
                doc,
                doc_hash,
                cursor,
                span.start_line - 1,
                Vec::new(),
                max_chunk_lines,
                0,
            ));
        }
        let span_start = span.start_line.max(cursor);
        let span_len = span.end_line.saturating_sub(span_start) + 1;
        if span_len > max_chunk_lines {
            chunks.extend(split_oversized(
                doc,
                doc_hash,
                span_start,
                span.end_line,
                vec![span.name.clone()],
                max_chunk_lines,
                overlap_lines,
            ));
        } else {
            chunks.push(make_chunk(doc, doc_hash, span_start, span.end_line, vec![span.name.clone()]));
        }
        cursor = span.end_line + 1;
    }

    if cursor <= total_lines {
        chunks.extend(split_oversized(doc, doc_hash, cursor, total_lines, Vec::new(), max_chunk_lines, 0));
    }

    chunks
}

fn fixed_line_chunks(doc: &Document, doc_hash: &str, max_chunk_lines: usize, overlap_lines: usize) -> Vec<Chunk> {
    let total_lines = line_count(&doc.content);
    if doc.content.is_empty() {
        return Vec::new();
    }
    split_oversized(doc, doc_hash, 1, total_lines, Vec::new(), max_chunk_lines, overlap_lines)
}

fn byte_window_chunks(doc: &Document, doc_hash: &str, max_bytes: usize, overlap_bytes: usize) -> Vec<Chunk> {
    let bytes = doc.content.as_bytes();
    if bytes.is_empty() {
        return Vec::new();
    }
    let step = max_bytes.saturating_sub(overlap_bytes).max(1);
    let mut out = Vec::new();
    let mut start = 0usize;
    while start < bytes.len() {
        let mut end = (start + max_bytes).min(bytes.len());
        while end < bytes.len() && !doc.content.is_char_boundary(end) {
            end += 1;
        }
        let text = doc.content[start..end].to_string();
        let start_line = doc.content[..start].matches('\n').count() + 1;
        let end_line = doc.content[..end].matches('\n').count() + 1;
        let chunk_hash = crate::document::content_hash(&text);
        out.push(Chunk {
            chunk_id: Chunk::derive_id(doc_hash, start_line, end_line),
            doc_hash: doc_hash.to_string(),
            path: doc.path.clone(),
            language: doc.language.clone(),
            start_line,
            end_line,
            start_byte: start,
            end_byte: end,
            text,
            symbols: Vec::new(),
            chunk_hash,
            extra: Default::default(),
        });
        if end >= bytes.len() {
            break;
        }
        start += step;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(path: &str, content: &str) -> Document {
        Document { path: path.to_string(), content: content.to_string(), language: None, extra: Default::default() }
    }

    #[test]
    fn fixed_line_covers_whole_document() {
        let content = (1..=50).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let d = doc("a.txt", &content);
        let chunks = fixed_line_chunks(&d, "hash", 10, 2);
        assert_eq!(chunks.first().unwrap().start_line, 1);
        assert_eq!(chunks.last().unwrap().end_line, line_count(&content));
    }

    #[test]
    fn structural_rust_function_becomes_a_chunk() {
        let content = "use std::fmt;\n\nfn hello() {\n    println!(\"hi\");\n}\n";
        let d = doc("a.rs", content);
        #[cfg(feature = "treesitter")]
        {
            let spans = structural_spans(&d).unwrap();
            assert_eq!(spans.len(), 1);
            assert_eq!(spans[0].name, "hello");
            let chunks = build_chunks_from_spans(&d, "hash", &spans, 120, 10);
            let covers_fn = chunks.iter().any(|c| c.symbols.contains(&"hello".to_string()));
            assert!(covers_fn);
            let total_lines = line_count(content);
            assert_eq!(chunks.last().unwrap().end_line, total_lines.min(chunks.last().unwrap().end_line));
        }
    }

    #[test]
    fn byte_window_covers_document() {
        let content = "x".repeat(500);
        let d = doc("a.bin", &content);
        let chunks = byte_window_chunks(&d, "hash", 200, 20);
        assert_eq!(chunks.first().unwrap().start_byte, 0);
        assert_eq!(chunks.last().unwrap().end_byte, 500);
    }

    #[test]
    fn oversized_symbol_splits_with_overlap() {
        let content = (1..=300).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let d = doc("a.txt", &content);
        let symbols = vec![SymbolSpan { name: "big".to_string(), start_line: 1, end_line: 300 }];
        let chunks = build_chunks_from_spans(&d, "hash", &symbols, 50, 5);
        assert!(chunks.len() > 1);
        assert_eq!(chunks.first().unwrap().start_line, 1);
        assert_eq!(chunks.last().unwrap().end_line, 300);
    }
}
