//! Instructions sent to vision backends alongside each page image.
//!
//! A backend uses [`crate::config::BackendConfig::instruction`] when set and
//! [`DEFAULT_INSTRUCTION`] otherwise. Every provider receives the same text,
//! so switching backends mid-document does not change the output style.

/// Default transcription instruction.
pub const DEFAULT_INSTRUCTION: &str = r#"You are an OCR engine. Transcribe the attached page image into clean Markdown.

Rules:

1. FIDELITY
   - Transcribe every piece of visible text exactly as written
   - Keep the natural reading order, column by column
   - Do not summarise, translate, or correct the wording

2. STRUCTURE
   - Mark headings with #, ## and ### according to their visual weight
   - Keep bulleted and numbered lists as Markdown lists, with their nesting
   - Render tables as GFM pipe tables; fall back to HTML for merged cells
   - Render formulas as LaTeX: $inline$ and $$display$$

3. SKIP
   - Running headers, footers and page numbers
   - Decorative rules and borders

4. OUTPUT
   - Output only the transcription, with no preamble or commentary
   - Do not wrap the result in ``` fences
   - If the page has no legible text, output nothing"#;

/// Resolve the instruction for a backend.
pub fn instruction_or_default(custom: Option<&str>) -> &str {
    custom
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(DEFAULT_INSTRUCTION)
}
