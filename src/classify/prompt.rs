//! Prompt sent alongside every image.

/// Instruction asking the model for a verdict JSON object.
pub const PROMPT: &str = r#"You help sort personal photos. Look at the image and decide whether the owner should keep it.

Return ONLY a valid JSON object, no markdown and no extra text:

{
  "decision": "keep" | "unsure" | "delete",
  "confidence_keep": 0.0-1.0,
  "confidence_unsure": 0.0-1.0,
  "confidence_delete": 0.0-1.0,
  "primary_category": "personal" | "people" | "landscape" | "screenshot" | "meme" | "document" | "blurry" | "duplicate" | "other",
  "reason": "one short sentence"
}

Rules:
- The three confidences sum to 1.0.
- Lean to "keep" for personal moments, faces, pets and meaningful places.
- Lean to "delete" for blurry shots, memes, screenshots, receipts and accidental photos.
- Use "document" as primary_category for photographed paper, whiteboards, IDs and forms.
- Use "unsure" when quality or content is ambiguous."#;
