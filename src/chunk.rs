//! Structure-aware text chunker.
//!
//! Splits raw document text into [`ChunkDraft`]s in one of three modes
//! (see [`ChunkMode`]):
//!
//! | Mode | Behaviour |
//! |------|-----------|
//! | `full` | The whole document is one chunk (`full_page` for web sources, `full_doc` otherwise). |
//! | `fixed` | Sliding window of `max_chars` characters, `overlap` characters carried forward. |
//! | `section` | Markdown headings open sections; fenced code blocks and lists are kept whole where possible. |
//!
//! In `section` mode a fenced code block longer than `max_chars` is split only
//! at line boundaries, and the resulting pieces never receive (or donate)
//! overlap text, so every code line appears intact in exactly one chunk.
//!
//! All lengths are measured in characters, never bytes.

use crate::models::{ChunkContext, ChunkDraft, ChunkKind, ChunkMetadata, ChunkMode, ChunkOptions};

/// A code block may exceed `max_chars` by this factor before it is split.
const CODE_BLOCK_TOLERANCE: f64 = 1.5;
/// A list may exceed `max_chars` by this factor before it is split per item.
const LIST_TOLERANCE: f64 = 1.2;

const WEB_SOURCE_KINDS: &[&str] = &["web", "wiki", "html", "page"];

/// Split `text` into chunks with contiguous `chunk_no` starting at 0.
///
/// `title_hint` is used as `doc_title` when the text has no level-1 heading.
/// `doc_version` in the returned metadata is 0; the caller stamps it.
pub fn chunk_document(
    text: &str,
    source_kind: &str,
    options: &ChunkOptions,
    title_hint: Option<&str>,
) -> Vec<ChunkDraft> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let mut drafts = match options.mode {
        ChunkMode::Full => chunk_full(text, source_kind, title_hint),
        ChunkMode::Fixed => chunk_fixed(text, options.max_chars, options.overlap, title_hint),
        ChunkMode::Section => chunk_sections(text, source_kind, options, title_hint),
    };

    for (i, draft) in drafts.iter_mut().enumerate() {
        draft.metadata.context_mut().chunk_no = i as u32;
    }
    drafts
}

// ============ full ============

fn chunk_full(text: &str, source_kind: &str, title_hint: Option<&str>) -> Vec<ChunkDraft> {
    let content = text.trim();
    let kind = if WEB_SOURCE_KINDS.contains(&source_kind.to_ascii_lowercase().as_str()) {
        ChunkKind::FullPage
    } else {
        ChunkKind::FullDoc
    };
    let context = ChunkContext {
        doc_title: first_h1(content).or_else(|| title_hint.map(str::to_string)),
        ..Default::default()
    };
    vec![ChunkDraft {
        content: content.to_string(),
        metadata: ChunkMetadata::new(kind, None, context),
    }]
}

// ============ fixed ============

fn chunk_fixed(
    text: &str,
    max_chars: usize,
    overlap: usize,
    title_hint: Option<&str>,
) -> Vec<ChunkDraft> {
    let doc_title = first_h1(text).or_else(|| title_hint.map(str::to_string));
    split_fixed(text, max_chars, overlap)
        .into_iter()
        .map(|content| {
            let (kind, lang) = classify(&content);
            ChunkDraft {
                metadata: ChunkMetadata::new(
                    kind,
                    lang,
                    ChunkContext {
                        doc_title: doc_title.clone(),
                        ..Default::default()
                    },
                ),
                content,
            }
        })
        .collect()
}

/// Sliding character window. Pieces are trimmed and empty pieces dropped.
pub fn split_fixed(text: &str, max_chars: usize, overlap: usize) -> Vec<String> {
    if max_chars == 0 {
        let trimmed = text.trim();
        return if trimmed.is_empty() {
            Vec::new()
        } else {
            vec![trimmed.to_string()]
        };
    }
    let overlap = clamp_overlap(overlap, max_chars);

    let chars: Vec<char> = text.chars().collect();
    let mut pieces = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let end = (start + max_chars).min(chars.len());
        let piece: String = chars[start..end].iter().collect();
        let piece = piece.trim();
        if !piece.is_empty() {
            pieces.push(piece.to_string());
        }
        if end == chars.len() {
            break;
        }
        start = end - overlap;
    }

    pieces
}

fn clamp_overlap(overlap: usize, max_chars: usize) -> usize {
    if overlap >= max_chars {
        max_chars / 4
    } else {
        overlap
    }
}

/// Content-based kind detection for chunks whose structure was not tracked.
fn classify(content: &str) -> (ChunkKind, Option<String>) {
    for line in content.lines() {
        if let Some(lang) = fence_open(line) {
            return (ChunkKind::Code, lang);
        }
    }
    if content.lines().any(is_list_item) {
        return (ChunkKind::List, None);
    }
    (ChunkKind::Text, None)
}

// ============ section ============

/// Lexical unit of a section.
#[derive(Debug)]
enum Block {
    /// Fenced code (fence lines included) or a whole source file.
    Code {
        lang: Option<String>,
        lines: Vec<String>,
    },
    /// Consecutive list items; each item keeps its continuation lines.
    List { items: Vec<String> },
    /// Any other line, possibly blank.
    Line(String),
}

#[derive(Debug, Default)]
struct Section {
    path: Vec<String>,
    blocks: Vec<Block>,
}

fn chunk_sections(
    text: &str,
    source_kind: &str,
    options: &ChunkOptions,
    title_hint: Option<&str>,
) -> Vec<ChunkDraft> {
    let max_chars = if options.max_chars == 0 {
        usize::MAX
    } else {
        options.max_chars
    };

    let is_source_code = source_kind.eq_ignore_ascii_case("code");
    let sections = if is_source_code {
        vec![Section {
            path: Vec::new(),
            blocks: vec![Block::Code {
                lang: None,
                lines: text.lines().map(str::to_string).collect(),
            }],
        }]
    } else {
        parse_sections(text)
    };
    let doc_title = if is_source_code {
        title_hint.map(str::to_string)
    } else {
        first_h1(text).or_else(|| title_hint.map(str::to_string))
    };

    let mut pieces: Vec<(Piece, Vec<String>)> = Vec::new();
    for section in sections {
        let mut packer = Packer::new(max_chars);
        for block in section.blocks {
            packer.push_block(block);
        }
        for piece in packer.finish() {
            pieces.push((piece, section.path.clone()));
        }
    }

    let overlap = if options.max_chars == 0 {
        0
    } else {
        clamp_overlap(options.overlap, options.max_chars)
    };

    let mut drafts = Vec::with_capacity(pieces.len());
    let mut previous: Option<&Piece> = None;
    for (piece, path) in &pieces {
        let mut content = piece.text.clone();
        if overlap > 0 && piece.code.is_none() {
            if let Some(prev) = previous.filter(|p| p.code.is_none()) {
                content = format!("{}\n\n{}", tail_chars(&prev.text, overlap), content);
            }
        }
        previous = Some(piece);

        let (kind, lang) = match &piece.code {
            Some(lang) => (ChunkKind::Code, lang.clone()),
            None if piece.list => (ChunkKind::List, None),
            None => (ChunkKind::Text, None),
        };
        let context = ChunkContext {
            section_path: if path.is_empty() {
                None
            } else {
                Some(path.join(" > "))
            },
            section_title: path.last().cloned(),
            doc_title: doc_title.clone(),
            ..Default::default()
        };
        drafts.push(ChunkDraft {
            content,
            metadata: ChunkMetadata::new(kind, lang, context),
        });
    }
    drafts
}

fn parse_sections(text: &str) -> Vec<Section> {
    let lines: Vec<&str> = text.lines().collect();
    let mut sections = vec![Section::default()];
    let mut stack: Vec<(usize, String)> = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];

        if let Some(lang) = fence_open(line) {
            let marker = fence_marker(line);
            let mut block = vec![line.to_string()];
            i += 1;
            while i < lines.len() {
                block.push(lines[i].to_string());
                let closes = fence_closes(lines[i], marker);
                i += 1;
                if closes {
                    break;
                }
            }
            current(&mut sections).blocks.push(Block::Code { lang, lines: block });
            continue;
        }

        if let Some((level, title)) = heading(line) {
            while stack.last().is_some_and(|(l, _)| *l >= level) {
                stack.pop();
            }
            stack.push((level, title));
            sections.push(Section {
                path: stack.iter().map(|(_, t)| t.clone()).collect(),
                blocks: vec![Block::Line(line.to_string())],
            });
            i += 1;
            continue;
        }

        if is_list_item(line) {
            let mut items = vec![line.to_string()];
            i += 1;
            while i < lines.len() {
                let next = lines[i];
                if next.trim().is_empty() || fence_open(next).is_some() {
                    break;
                }
                if is_list_item(next) {
                    items.push(next.to_string());
                } else if is_continuation(next) {
                    if let Some(last) = items.last_mut() {
                        last.push('\n');
                        last.push_str(next);
                    }
                } else {
                    break;
                }
                i += 1;
            }
            current(&mut sections).blocks.push(Block::List { items });
            continue;
        }

        current(&mut sections).blocks.push(Block::Line(line.to_string()));
        i += 1;
    }

    sections.retain(|s| {
        s.blocks.iter().any(|b| match b {
            Block::Line(l) => !l.trim().is_empty(),
            _ => true,
        })
    });
    sections
}

fn current(sections: &mut Vec<Section>) -> &mut Section {
    if sections.is_empty() {
        sections.push(Section::default());
    }
    let last = sections.len() - 1;
    &mut sections[last]
}

/// A finished chunk body before overlap is applied.
#[derive(Debug, Default, Clone)]
struct Piece {
    text: String,
    /// `Some(lang)` when the piece holds (part of) a code block.
    code: Option<Option<String>>,
    list: bool,
}

/// Greedy packer that fills chunks up to `max` characters, block by block.
struct Packer {
    max: usize,
    out: Vec<Piece>,
    buf: Piece,
    buf_len: usize,
}

impl Packer {
    fn new(max: usize) -> Self {
        Self {
            max,
            out: Vec::new(),
            buf: Piece::default(),
            buf_len: 0,
        }
    }

    fn push_block(&mut self, block: Block) {
        match block {
            Block::Code { lang, lines } => self.push_code(lang, lines),
            Block::List { items } => self.push_list(items),
            Block::Line(line) => self.push_line(&line),
        }
    }

    fn push_code(&mut self, lang: Option<String>, lines: Vec<String>) {
        let block_len: usize = lines.iter().map(|l| char_len(l) + 1).sum();

        if block_len <= self.max {
            if self.buf_len > 0 && self.buf_len + block_len > self.max {
                self.flush();
            }
            for line in &lines {
                self.append(line);
            }
            if self.buf.code.is_none() {
                self.buf.code = Some(lang);
            }
        } else if (block_len as f64) <= self.max as f64 * CODE_BLOCK_TOLERANCE {
            self.flush();
            self.emit(lines.join("\n"), Some(lang), false);
        } else {
            self.flush();
            let mut run: Vec<&str> = Vec::new();
            let mut run_len = 0;
            for line in &lines {
                let len = char_len(line) + 1;
                if !run.is_empty() && run_len + len > self.max {
                    // Trailing blank lines open the next run so none is lost
                    // at the boundary.
                    let blanks = run.iter().rev().take_while(|l| l.trim().is_empty()).count();
                    let carried = run.split_off(run.len() - blanks);
                    self.emit_code_run(&run, &lang);
                    run = carried;
                    run_len = run.iter().map(|l| char_len(l) + 1).sum();
                }
                run.push(line);
                run_len += len;
            }
            self.emit_code_run(&run, &lang);
        }
    }

    fn push_list(&mut self, items: Vec<String>) {
        let list_len: usize = items.iter().map(|i| char_len(i) + 1).sum();

        if self.buf_len + list_len <= self.max {
            for item in &items {
                self.append(item);
            }
            self.buf.list = true;
            return;
        }

        self.flush();
        if (list_len as f64) <= self.max as f64 * LIST_TOLERANCE {
            for item in &items {
                self.append(item);
            }
            self.buf.list = true;
            return;
        }

        for item in &items {
            let len = char_len(item) + 1;
            if self.buf_len > 0 && self.buf_len + len > self.max {
                self.flush();
            }
            self.append(item);
            self.buf.list = true;
        }
    }

    fn push_line(&mut self, line: &str) {
        if line.trim().is_empty() {
            if self.buf_len > 0 {
                self.buf.text.push('\n');
                self.buf_len += 1;
            }
            return;
        }

        let len = char_len(line);
        if self.buf_len + len + 1 <= self.max {
            self.append(line);
            return;
        }

        self.flush();
        if len <= self.max {
            self.append(line);
            return;
        }

        let mut parts = split_sentences(line, self.max);
        let last = parts.pop();
        for part in parts {
            self.emit(part, None, false);
        }
        if let Some(last) = last {
            self.append(&last);
        }
    }

    fn append(&mut self, text: &str) {
        self.buf.text.push_str(text);
        self.buf.text.push('\n');
        self.buf_len += char_len(text) + 1;
    }

    fn emit(&mut self, text: String, code: Option<Option<String>>, list: bool) {
        let text = tidy(&text);
        if !text.is_empty() {
            self.out.push(Piece { text, code, list });
        }
    }

    /// Emit a slice of a split code block untouched, blank lines included.
    fn emit_code_run(&mut self, run: &[&str], lang: &Option<String>) {
        if run.iter().all(|l| l.trim().is_empty()) {
            return;
        }
        self.out.push(Piece {
            text: run.join("\n"),
            code: Some(lang.clone()),
            list: false,
        });
    }

    fn flush(&mut self) {
        let piece = std::mem::take(&mut self.buf);
        self.buf_len = 0;
        self.emit(piece.text, piece.code, piece.list);
    }

    fn finish(mut self) -> Vec<Piece> {
        self.flush();
        self.out
    }
}

/// Split a long line at sentence ends, grouping sentences up to `max`
/// characters. A sentence longer than `max` is cut at character boundaries.
fn split_sentences(line: &str, max: usize) -> Vec<String> {
    let mut sentences: Vec<String> = Vec::new();
    let mut start = 0;
    let mut iter = line.char_indices().peekable();
    while let Some((idx, ch)) = iter.next() {
        if matches!(ch, '.' | '!' | '?') {
            let mut end = idx + ch.len_utf8();
            let mut saw_space = false;
            while let Some(&(next_idx, next)) = iter.peek() {
                if next.is_whitespace() {
                    saw_space = true;
                    end = next_idx + next.len_utf8();
                    iter.next();
                } else {
                    break;
                }
            }
            if saw_space {
                sentences.push(line[start..end].to_string());
                start = end;
            }
        }
    }
    if start < line.len() {
        sentences.push(line[start..].to_string());
    }

    let mut groups = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;
    for sentence in sentences {
        let len = char_len(&sentence);
        if len > max {
            if !current.is_empty() {
                groups.push(std::mem::take(&mut current));
                current_len = 0;
            }
            let chars: Vec<char> = sentence.chars().collect();
            for window in chars.chunks(max) {
                groups.push(window.iter().collect());
            }
            continue;
        }
        if !current.is_empty() && current_len + len > max {
            groups.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current.push_str(&sentence);
        current_len += len;
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
        .into_iter()
        .map(|g| g.trim().to_string())
        .filter(|g| !g.is_empty())
        .collect()
}

// ============ line classification ============

fn heading(line: &str) -> Option<(usize, String)> {
    let level = line.chars().take_while(|c| *c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &line[level..];
    if !rest.starts_with(|c: char| c.is_whitespace()) {
        return None;
    }
    let title = rest.trim().trim_end_matches('#').trim();
    if title.is_empty() {
        return None;
    }
    Some((level, title.to_string()))
}

fn first_h1(text: &str) -> Option<String> {
    let mut in_fence = false;
    for line in text.lines() {
        if fence_open(line).is_some() {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if let Some((1, title)) = heading(line) {
            return Some(title);
        }
    }
    None
}

fn fence_marker(line: &str) -> &'static str {
    if line.trim_start().starts_with("~~~") {
        "~~~"
    } else {
        "```"
    }
}

/// A closing fence is the marker alone, optionally longer; no info string.
fn fence_closes(line: &str, marker: &str) -> bool {
    let trimmed = line.trim();
    let Some(fence_char) = marker.chars().next() else {
        return false;
    };
    trimmed.chars().count() >= marker.chars().count() && trimmed.chars().all(|c| c == fence_char)
}

/// Returns `Some(lang)` if the line opens a fenced code block.
fn fence_open(line: &str) -> Option<Option<String>> {
    let trimmed = line.trim_start();
    let rest = trimmed
        .strip_prefix("```")
        .or_else(|| trimmed.strip_prefix("~~~"))?;
    let lang = rest
        .trim_start_matches(['`', '~'])
        .split_whitespace()
        .next()
        .map(str::to_string);
    Some(lang)
}

fn is_list_item(line: &str) -> bool {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed
        .strip_prefix('-')
        .or_else(|| trimmed.strip_prefix('*'))
        .or_else(|| trimmed.strip_prefix('•'))
    {
        return rest.starts_with(|c: char| c.is_whitespace());
    }
    let digits = trimmed.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return false;
    }
    let rest = &trimmed[digits..];
    rest.strip_prefix('.')
        .is_some_and(|r| r.starts_with(|c: char| c.is_whitespace()))
}

fn is_continuation(line: &str) -> bool {
    line.starts_with("  ") || line.starts_with('\t')
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn tail_chars(s: &str, n: usize) -> &str {
    let count = char_len(s);
    if count <= n {
        return s;
    }
    match s.char_indices().nth(count - n) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

/// Drop leading blank lines and trailing whitespace; keep leading indentation.
fn tidy(s: &str) -> String {
    let start = s
        .split_inclusive('\n')
        .take_while(|l| l.trim().is_empty())
        .map(str::len)
        .sum::<usize>();
    s[start..].trim_end().to_string()
}
