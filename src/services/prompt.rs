use std::borrow::Cow;

use crate::models::options::{OptionGroup, StyleOptions};

const DEFAULT_SHOT_TYPE: &str = "half body";
const DEFAULT_EXPRESSION: &str = "natural smile";
const DEFAULT_LIGHTING: &str = "studio light";
const DEFAULT_MOOD: &str = "professional";
const DEFAULT_BACKGROUND: &str = "studio";

/// Placeholders every template must contain, in the order they appear in
/// the standard template.
pub const PLACEHOLDERS: [&str; 5] = ["composition", "expression", "lighting", "mood", "background"];

/// Instructions sent to the image model with every job.
pub const PROFILE_PHOTO_TEMPLATE: &str = r#"Create a high-quality professional profile photo.

IDENTITY LOCK (HIGHEST PRIORITY — STRICT):
- Reproduce the SAME PERSON as in the FIRST image. Do NOT invent or mix a new person.
- Preserve facial landmarks and ratios within very small tolerance:
  eyes spacing, eye shape/size, nose width/bridge/tip shape, lip shape, jawline, cheekbones, chin length, hairline.
- Preserve skin undertone and permanent marks (moles/freckles) and age/gender cues.
- Allowed beautification = subtle only:
  even skin tone (+slightly brighter exposure), light blemish cleanup, slightly sharper eyes, gentle jawline definition.
- FORBIDDEN changes:
  iris color, hairstyle length or hairline shift, face morphing beyond ~3% scale/ratio change,
  nose/eye reshaping, lip resizing, age regression/progression, gender change.
- If identity cannot be preserved with high confidence, DO NOT generate a different face; RETURN a failure.

INPUT IMAGES:
- Main subject: the FIRST uploaded image (this is the person to render).
- Optional props: up to 3 additional images containing clothing or accessories. If provided, transfer only the outfit/accessory design to the main subject. Do not change the face identity based on prop images.

Subject Settings:
- Composition: {composition}
- Expression: {expression}
- Lighting: {lighting}
- Mood/Feeling: {mood}
- Background: {background}

Identity Preservation (highest priority):
- Keep the same person as in the FIRST image. Do NOT create a new person.
- Preserve unique facial traits: overall face shape, eye shape/size, nose and lip shape, hairline, moles/freckles, skin undertone, age/gender cues.
- Allowed beautification (subtle only): even skin tone and slightly brighter exposure, light blemish cleanup, slightly sharper eyes, gentle jawline definition.
- Do NOT alter iris color, hairstyle length, facial hair status, or face proportions beyond a subtle refinement (max ~5% slimming). No nose/eye reshaping.

Props Application (only if prop images exist):
- Use clothing/accessory design from prop images on the main subject.
- Match fit and perspective naturally; ignore prop image backgrounds.

General Requirements:
- Realistic studio-grade portrait. Subject must be the main focus (background can be softly blurred).
- Maintain consistent lighting with the chosen tone.
- Keep body and facial proportions natural.
- No added text, logos, or unrelated props.

Output Style:
- Photorealistic, clean, balanced lighting
- Suitable for professional or social media profile use

Priority Order (in case of conflicts):
1) Identity preservation of the main subject
2) Composition & expression
3) Lighting & mood
4) Props from additional images
5) Background styling

Negative Constraints:
- over-smoothing, plastic skin, cartoonish look
- distorted anatomy, excessive slimming, AI artifacts
- changed identity (different person), mismatched age/gender
- text or logos in the image
"#;

/// A prompt template whose placeholders have been checked up front.
///
/// A template missing a placeholder is a deployment mistake, so it is
/// rejected when the process starts instead of failing every job.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    text: Cow<'static, str>,
}

impl PromptTemplate {
    pub fn new(text: impl Into<Cow<'static, str>>) -> Result<Self, PromptError> {
        let text = text.into();
        for name in PLACEHOLDERS {
            if !text.contains(&format!("{{{name}}}")) {
                return Err(PromptError::MissingPlaceholder(name));
            }
        }
        Ok(Self { text })
    }

    /// The built-in profile photo template.
    pub fn standard() -> Result<Self, PromptError> {
        Self::new(PROFILE_PHOTO_TEMPLATE)
    }

    /// Substitute resolved settings in a single pass, so values that happen
    /// to contain `{...}` are never expanded again.
    pub fn render(&self, settings: &PromptSettings<'_>) -> String {
        let mut out = String::with_capacity(self.text.len() + 128);
        let mut rest: &str = &self.text;

        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let tail = &rest[start..];
            let substituted = tail
                .find('}')
                .and_then(|end| settings.lookup(&tail[1..end]).map(|value| (end, value)));

            match substituted {
                Some((end, value)) => {
                    out.push_str(value);
                    rest = &tail[end + 1..];
                }
                None => {
                    out.push('{');
                    rest = &tail[1..];
                }
            }
        }

        out.push_str(rest);
        out
    }
}

/// The five resolved values substituted into the template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSettings<'a> {
    pub composition: Cow<'a, str>,
    pub expression: &'a str,
    pub lighting: &'a str,
    pub mood: &'a str,
    pub background: Cow<'a, str>,
}

impl<'a> PromptSettings<'a> {
    /// Apply defaults and the shot type / background rendering rules.
    pub fn resolve(options: &'a StyleOptions) -> Self {
        Self {
            composition: shot_type_phrase(or_default(&options.shot_type, DEFAULT_SHOT_TYPE)),
            expression: or_default(&options.expression, DEFAULT_EXPRESSION),
            lighting: or_default(&options.lighting, DEFAULT_LIGHTING),
            mood: or_default(&options.mood, DEFAULT_MOOD),
            background: background_phrase(&options.background),
        }
    }

    fn lookup(&self, name: &str) -> Option<&str> {
        match name {
            "composition" => Some(&*self.composition),
            "expression" => Some(self.expression),
            "lighting" => Some(self.lighting),
            "mood" => Some(self.mood),
            "background" => Some(&*self.background),
            _ => None,
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

fn or_default<'a>(value: &'a Option<String>, default: &'static str) -> &'a str {
    non_empty(value.as_deref()).unwrap_or(default)
}

/// `upper_body` → `upper body`.
pub fn shot_type_phrase(raw: &str) -> Cow<'_, str> {
    if raw.contains('_') {
        Cow::Owned(raw.replace('_', " "))
    } else {
        Cow::Borrowed(raw)
    }
}

/// Render the background group.
///
/// `monotone` carries its colour when one is set; any other type is used
/// as-is, and a missing or empty type falls back to `studio`.
pub fn background_phrase(background: &OptionGroup) -> Cow<'_, str> {
    match background.get("type") {
        Some("monotone") => match non_empty(background.get("color")) {
            Some(color) => Cow::Owned(format!("monotone (color: {color})")),
            None => Cow::Borrowed("monotone"),
        },
        Some(other) if !other.is_empty() => Cow::Borrowed(other),
        _ => Cow::Borrowed(DEFAULT_BACKGROUND),
    }
}

/// Build the generation prompt for one job's options.
pub fn build_prompt(template: &PromptTemplate, options: &StyleOptions) -> String {
    template.render(&PromptSettings::resolve(options))
}

#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("Prompt template is missing the {{{0}}} placeholder")]
    MissingPlaceholder(&'static str),
}
