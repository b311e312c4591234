use crate::context::{AnalysisContext, DocumentInput};
use crate::error::PipelineError;
use crate::model::Chapter;
use crate::phases::{StageHandler, StageServices};
use crate::result::StageResult;
use crate::stage::Stage;
use sha2::{Digest, Sha256};
use std::fs;
use tracing::info;

const CHAPTER_KEYWORDS: [&str; 3] = ["chapter", "capítulo", "capitulo"];

/// Plain-text parsing stage (PARSING)
///
/// Loads UTF-8 text, normalizes line endings, fingerprints the document and
/// splits it into chapters on heading lines.
#[derive(Debug, Default, Clone)]
pub struct PlainTextParser;

impl PlainTextParser {
    pub fn new() -> Self {
        Self
    }

    fn load(input: &DocumentInput) -> Result<String, PipelineError> {
        match input {
            DocumentInput::Text { text, .. } => Ok(text.clone()),
            DocumentInput::Path(path) => fs::read_to_string(path).map_err(|e| {
                PipelineError::fatal(
                    Stage::Parsing,
                    format!("cannot read {}: {}", path.display(), e),
                )
            }),
        }
    }
}

impl StageHandler for PlainTextParser {
    fn name(&self) -> &str {
        "plain_text_parser"
    }

    fn execute(&self, ctx: &mut AnalysisContext, _services: &StageServices) -> StageResult<()> {
        let raw = match Self::load(&ctx.input) {
            Ok(raw) => raw,
            Err(e) => return StageResult::failure(e),
        };

        let text = normalize_line_endings(&raw);
        ctx.fingerprint = fingerprint(&text);
        ctx.chapters = detect_chapters(&text, &ctx.document_name);

        let total_characters = text.chars().count();
        let total_words = text.split_whitespace().count();
        ctx.set_stat("total_characters", total_characters);
        ctx.set_stat("total_words", total_words);
        ctx.set_stat("chapters", ctx.chapters.len());

        info!(
            "Parsed '{}': {} chars, {} words, {} chapters",
            ctx.document_name,
            total_characters,
            total_words,
            ctx.chapters.len()
        );

        ctx.full_text = text;
        StageResult::success(())
    }
}

fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Hex SHA-256 of the text.
pub fn fingerprint(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Heading title if `line` opens a chapter.
///
/// Recognized: `Chapter 3`, `CAPÍTULO IV: El faro` and markdown
/// `#`/`##` headings.
fn chapter_heading(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(rest) = trimmed.strip_prefix('#') {
        let title = rest.trim_start_matches('#').trim();
        let level = trimmed.len() - trimmed.trim_start_matches('#').len();
        return (level <= 2 && !title.is_empty()).then(|| title.to_string());
    }

    let lower = trimmed.to_lowercase();
    let mut words = lower.split_whitespace();
    let keyword = words.next()?;
    let number = words.next()?.trim_end_matches(|c: char| c == ':' || c == '.');

    let is_number = !number.is_empty()
        && (number.chars().all(|c| c.is_ascii_digit())
            || number.chars().all(|c| matches!(c, 'i' | 'v' | 'x' | 'l' | 'c')));

    (CHAPTER_KEYWORDS.contains(&keyword) && is_number).then(|| trimmed.to_string())
}

/// Split `text` into chapters. Offsets are in chars, `end_char` exclusive.
///
/// Text without any heading becomes a single chapter titled `fallback_title`;
/// empty text has no chapters. The first chapter's span starts at 0 so text
/// before the first heading stays covered.
pub fn detect_chapters(text: &str, fallback_title: &str) -> Vec<Chapter> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    // (title, heading start, content start) in chars
    let mut headings: Vec<(String, usize, usize)> = Vec::new();
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        let len = line.chars().count();
        if let Some(title) = chapter_heading(line) {
            headings.push((title, offset, offset + len));
        }
        offset += len;
    }
    let total = offset;

    if headings.is_empty() {
        return vec![Chapter {
            number: 1,
            title: fallback_title.to_string(),
            start_char: 0,
            end_char: total,
            content: text.to_string(),
        }];
    }

    let chars: Vec<char> = text.chars().collect();
    let mut chapters = Vec::with_capacity(headings.len());
    for (idx, (title, start, content_start)) in headings.iter().enumerate() {
        let start_char = if idx == 0 { 0 } else { *start };
        let end_char = headings.get(idx + 1).map_or(total, |(_, next, _)| *next);
        let content: String = chars[*content_start..end_char].iter().collect();
        chapters.push(Chapter {
            number: idx as u32 + 1,
            title: title.clone(),
            start_char,
            end_char,
            content: content.trim().to_string(),
        });
    }
    chapters
}
