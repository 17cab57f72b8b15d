//! Embedded prompt templates
//!
//! Compiled into the binary and used when no override files are present.
//! Templates are Handlebars; stage inputs are passed as template values.

/// System prompt for text extraction cleanup
pub const EXTRACT_SYSTEM: &str = r#"You clean raw text extracted from research-paper PDFs.

Remove page headers, footers, page numbers, and hyphenation artifacts.
Preserve paragraph structure, section headings, equations, and citations.
Output ONLY the cleaned text, nothing else.
"#;

/// User prompt for one extraction chunk
pub const EXTRACT_CHUNK_USER: &str = r#"Clean the following extracted text (part {{part}} of {{total}}):

{{chunk}}
"#;

/// User prompt for the section index over cleaned text
pub const EXTRACT_SECTIONS_USER: &str = r#"List the top-level sections of this paper.

Output a JSON array, each element: {"title": string, "offset": integer}
where offset is the approximate character position of the section heading.
Output ONLY the JSON array.

Text:
{{text}}
"#;

/// System prompt for metadata enrichment
pub const METADATA_SYSTEM: &str = r#"You extract bibliographic metadata from research-paper text.

Output ONLY a JSON object with these fields:
{"title": string, "authors": [string], "venue": string or null, "year": integer or null}

Use the paper's own title page. Do not invent values; use null when a
field cannot be determined from the text.
"#;

/// User prompt for metadata enrichment
pub const METADATA_USER: &str = r#"{{#if title_hint}}The uploader suggested the title may be: {{title_hint}}

{{/if}}Paper text (truncated):

{{text}}
"#;

/// System prompt for summarization
pub const SUMMARY_SYSTEM: &str = r#"You summarize research papers at three levels of detail.

Output ONLY a JSON object:
{"brief": string, "standard": string, "detailed": string}

brief: 2-3 sentences. standard: one paragraph. detailed: 3-5 paragraphs
covering method, results, and limitations. Each level must be strictly
longer than the previous one.
"#;

/// User prompt for summarization
pub const SUMMARY_USER: &str = r#"Title: {{title}}
{{#if authors}}Authors: {{authors}}{{/if}}

Paper text:

{{text}}
"#;

/// System prompt for concept explanation
pub const CONCEPTS_SYSTEM: &str = r#"You explain technical concepts from research papers to a graduate-student reader.

Output ONLY a JSON object mapping each term to a 2-4 sentence explanation:
{"term": "explanation", ...}

Explain terms as used in this specific paper, not in general.
"#;

/// User prompt for concept explanation
pub const CONCEPTS_USER: &str = r#"{{#if key_terms}}Explain these terms: {{key_terms}}

{{else}}Identify and explain the 5-10 most important technical terms.

{{/if}}Paper text:

{{text}}
"#;

/// System prompt for quality assessment
pub const QUALITY_SYSTEM: &str = r#"You assess whether a summary faithfully represents a paper.

Output ONLY a JSON object:
{"score": number between 0.0 and 1.0, "issues": [string]}

Deduct for claims absent from the paper, missing key results, and
misstated conclusions. An empty issues list must accompany scores above 0.9.
"#;

/// User prompt for quality assessment
pub const QUALITY_USER: &str = r#"Summary under review:

{{summary}}

Paper text:

{{text}}
"#;

/// System prompt for citation extraction
pub const CITATIONS_SYSTEM: &str = r#"You extract the reference list from research-paper text.

Output ONLY a JSON array, each element:
{"authors": [string], "title": string, "venue": string or null,
 "year": integer or null, "doi": string or null}

Include every entry of the bibliography. Do not format citations; output
structured fields only.
"#;

/// User prompt for citation extraction
pub const CITATIONS_USER: &str = r#"Paper text:

{{text}}
"#;

/// System prompt for related-paper discovery
pub const DISCOVERY_SYSTEM: &str = r#"You suggest research papers related to a given paper.

Output ONLY a JSON array, each element:
{"title": string, "authors": [string], "doi": string or null,
 "relationship": one of "citing", "cited-by", "semantic", "author-network", "venue-network", "topic-network",
 "relevance": number between 0.0 and 1.0}

Suggest only papers you are confident exist. Prefer well-known work.
"#;

/// User prompt for related-paper discovery
pub const DISCOVERY_USER: &str = r#"Paper metadata:

Title: {{title}}
{{#if authors}}Authors: {{authors}}{{/if}}
{{#if venue}}Venue: {{venue}}{{/if}}
{{#if year}}Year: {{year}}{{/if}}
"#;
