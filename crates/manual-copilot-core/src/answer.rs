//! Grounding context assembly and citation verification.
//!
//! [`AnswerAssembler::assemble`] renders retrieved passages into a bounded
//! context block, sends it with the conversation to the generation
//! capability, then checks every `(unit, page)` citation in the reply
//! against the passages that were actually supplied.
//!
//! Citations to anything else are reported in
//! [`Answer::unsupported_citations`] and the answer is marked unverified.
//! The assembler never adds or rewrites citations in the generated text.

use std::collections::HashSet;

use regex::Regex;
use serde::Serialize;

use crate::error::{RagError, Result};
use crate::generation::{ChatMessage, ContextPassage, GenerationProvider, GenerationRequest};
use crate::models::{Citation, RegistrySnapshot, UNIT_CHAR_CLASS};
use crate::retrieve::{RetrievalMode, RetrievedPassage};

/// Context text used when retrieval found nothing.
pub const NO_CONTEXT: &str = "No relevant manual content found.";

const PASSAGE_SEPARATOR: &str = "\n\n---\n\n";

const SYSTEM_PROMPT: &str = "You are an expert equipment technician assistant.
You have access to equipment manuals indexed by unit number.

When answering:
- Always cite the unit number and page number you are drawing information from, \
using the form [Unit <unit> | <file> | Page <page>].
- If the question mentions a specific unit, prioritise that unit's manual.
- If parts or cross-reference information is needed (e.g. hoses, filters, fittings), \
look across all manuals and note which unit each part belongs to.
- Only cite units and pages that appear in the context below.
- Be concise but complete. If the context does not contain the answer, say so.

Context from manuals:
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssemblyParams {
    /// Upper bound on the rendered context block, in characters.
    pub max_context_chars: usize,
    /// Most recent history messages forwarded to the generator.
    pub max_history_turns: usize,
    /// Length of the source snippets returned with the answer.
    pub snippet_chars: usize,
}

impl Default for AssemblyParams {
    fn default() -> Self {
        Self {
            max_context_chars: 12_000,
            max_history_turns: 10,
            snippet_chars: 300,
        }
    }
}

/// The rendered grounding block and the passages it contains.
#[derive(Debug, Clone, PartialEq)]
pub struct GroundingContext {
    pub text: String,
    pub supplied: Vec<ContextPassage>,
    /// Retrieval mode of each entry in `supplied`.
    pub modes: Vec<RetrievalMode>,
}

/// A supplied passage as reported back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourcePassage {
    pub unit: String,
    pub filename: String,
    pub page: u32,
    pub snippet: String,
    pub mode: RetrievalMode,
}

/// Generated answer with verified provenance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub text: String,
    /// Citations found in `text` that match a supplied passage, in order of
    /// first appearance.
    pub citations: Vec<Citation>,
    /// Every passage supplied to the generator.
    pub sources: Vec<SourcePassage>,
    /// Citations found in `text` that match no supplied passage.
    pub unsupported_citations: Vec<Citation>,
    /// `false` when any citation is unsupported.
    pub verified: bool,
    /// `false` when no manual content was supplied.
    pub grounded: bool,
}

/// Render passages into a context block of at most `max_context_chars`.
///
/// Passages are taken in ranked order; the first one that does not fit
/// ends the block, so only a prefix of the ranking is ever citable. A top
/// passage larger than the whole budget is cut to fit instead.
pub fn build_context(
    passages: &[RetrievedPassage],
    snapshot: &RegistrySnapshot,
    params: &AssemblyParams,
) -> GroundingContext {
    let mut text = String::new();
    let mut used = 0usize;
    let mut supplied = Vec::new();
    let mut modes = Vec::new();

    for p in passages {
        let entry = ContextPassage {
            unit: p.chunk.unit.clone(),
            filename: snapshot.filename(&p.chunk.unit).unwrap_or("unknown").to_string(),
            page: p.chunk.page,
            text: p.chunk.text.clone(),
        };
        let rendered = format!("{}\n{}", entry.tag(), entry.text);
        let sep = if supplied.is_empty() { 0 } else { PASSAGE_SEPARATOR.len() };
        let cost = sep + rendered.chars().count();
        if used + cost > params.max_context_chars {
            if supplied.is_empty() {
                let room = params
                    .max_context_chars
                    .saturating_sub(entry.tag().chars().count() + 1);
                if room > 0 {
                    let entry = ContextPassage {
                        text: entry.text.chars().take(room).collect(),
                        ..entry
                    };
                    text = format!("{}\n{}", entry.tag(), entry.text);
                    supplied.push(entry);
                    modes.push(p.mode);
                }
            }
            tracing::debug!(
                supplied = supplied.len(),
                remaining = passages.len() - supplied.len(),
                "context budget reached"
            );
            break;
        }
        if sep > 0 {
            text.push_str(PASSAGE_SEPARATOR);
        }
        text.push_str(&rendered);
        used += cost;
        supplied.push(entry);
        modes.push(p.mode);
    }

    if supplied.is_empty() {
        text = NO_CONTEXT.to_string();
    }

    GroundingContext {
        text,
        supplied,
        modes,
    }
}

/// System prompt with the grounding block appended.
pub fn system_prompt(context: &GroundingContext) -> String {
    format!("{SYSTEM_PROMPT}{}\n", context.text)
}

/// Finds `(unit, page)` citations in generated text.
#[derive(Debug, Clone)]
pub struct CitationExtractor {
    bracket: Regex,
    prose: Regex,
}

impl CitationExtractor {
    pub fn new() -> Result<Self> {
        let u = UNIT_CHAR_CLASS;
        let bracket = Regex::new(&format!(
            r"(?i)\[\s*unit\s*#?\s*({u}+)\s*[|,][^\]]*?\b(?:page|pg\.?|p\.)\s*(\d+)\s*\]"
        ))
        .map_err(|e| RagError::InvalidInput(e.to_string()))?;
        // Prose ids need a digit and may not end in '.', so a sentence
        // stop after the unit is not taken as part of it.
        let prose = Regex::new(&format!(
            r"(?i)\bunit\s*#?\s*({u}*\d(?:{u}*[\p{{Alphabetic}}\p{{N}}_\-])?)\s*(?:,\s*|\(\s*)?(?:page|pg\.?|p\.)\s*(\d+)"
        ))
        .map_err(|e| RagError::InvalidInput(e.to_string()))?;
        Ok(Self { bracket, prose })
    }

    /// Citations in order of first appearance, deduplicated.
    pub fn extract(&self, text: &str) -> Vec<Citation> {
        let mut found: Vec<(usize, Citation)> = Vec::new();
        for re in [&self.bracket, &self.prose] {
            for caps in re.captures_iter(text) {
                let (Some(whole), Some(unit), Some(page)) = (caps.get(0), caps.get(1), caps.get(2))
                else {
                    continue;
                };
                let Ok(page) = page.as_str().parse::<u32>() else {
                    continue;
                };
                found.push((
                    whole.start(),
                    Citation {
                        unit: unit.as_str().to_string(),
                        page,
                    },
                ));
            }
        }
        found.sort_by_key(|(pos, _)| *pos);

        let mut seen = HashSet::new();
        found
            .into_iter()
            .map(|(_, c)| c)
            .filter(|c| seen.insert(c.clone()))
            .collect()
    }
}

/// Split citations into supported and unsupported against `supplied`.
///
/// Unit names match case-insensitively and supported citations take the
/// supplied spelling.
pub fn verify_citations(
    citations: Vec<Citation>,
    supplied: &[ContextPassage],
) -> (Vec<Citation>, Vec<Citation>) {
    let mut supported = Vec::new();
    let mut unsupported = Vec::new();
    for c in citations {
        let hit = supplied
            .iter()
            .find(|p| p.page == c.page && p.unit.eq_ignore_ascii_case(&c.unit));
        match hit {
            Some(p) => {
                let normalized = Citation {
                    unit: p.unit.clone(),
                    page: p.page,
                };
                if !supported.contains(&normalized) {
                    supported.push(normalized);
                }
            }
            None => unsupported.push(c),
        }
    }
    (supported, unsupported)
}

pub struct AnswerAssembler<'a> {
    generator: &'a dyn GenerationProvider,
    citations: &'a CitationExtractor,
    params: AssemblyParams,
}

impl<'a> AnswerAssembler<'a> {
    pub fn new(
        generator: &'a dyn GenerationProvider,
        citations: &'a CitationExtractor,
        params: AssemblyParams,
    ) -> Self {
        Self {
            generator,
            citations,
            params,
        }
    }

    /// Build the request for one turn: system context, the last
    /// `max_history_turns` history messages, then `message`.
    pub fn request(
        &self,
        context: &GroundingContext,
        message: &str,
        history: &[ChatMessage],
    ) -> GenerationRequest {
        let skip = history.len().saturating_sub(self.params.max_history_turns);
        let mut messages: Vec<ChatMessage> = history[skip..].to_vec();
        messages.push(ChatMessage::user(message));
        GenerationRequest {
            system: system_prompt(context),
            messages,
            passages: context.supplied.clone(),
        }
    }

    pub async fn assemble(
        &self,
        passages: &[RetrievedPassage],
        snapshot: &RegistrySnapshot,
        message: &str,
        history: &[ChatMessage],
    ) -> Result<Answer> {
        let context = build_context(passages, snapshot, &self.params);
        let request = self.request(&context, message, history);
        let text = self.generator.generate(&request).await?;

        let (citations, unsupported) =
            verify_citations(self.citations.extract(&text), &context.supplied);
        for c in &unsupported {
            let err = RagError::UnsupportedCitation {
                unit: c.unit.clone(),
                page: c.page,
            };
            tracing::warn!(error = %err, model = self.generator.model_name(), "answer flagged as unverified");
        }

        let sources = context
            .supplied
            .iter()
            .zip(context.modes.iter())
            .map(|(p, mode)| SourcePassage {
                unit: p.unit.clone(),
                filename: p.filename.clone(),
                page: p.page,
                snippet: p.text.chars().take(self.params.snippet_chars).collect(),
                mode: *mode,
            })
            .collect();

        Ok(Answer {
            text,
            citations,
            verified: unsupported.is_empty(),
            unsupported_citations: unsupported,
            grounded: !context.supplied.is_empty(),
            sources,
        })
    }
}
