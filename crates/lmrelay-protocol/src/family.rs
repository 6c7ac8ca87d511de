use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::service::Service;

/// A named grouping of model ids used for access control and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModelFamily {
    #[serde(rename = "turbo")]
    Turbo,
    #[serde(rename = "turbo-instruct")]
    TurboInstruct,
    #[serde(rename = "gpt4")]
    Gpt4,
    #[serde(rename = "gpt4-turbo")]
    Gpt4Turbo,
    #[serde(rename = "gpt4o")]
    Gpt4o,
    #[serde(rename = "o1")]
    O1,
    #[serde(rename = "dall-e")]
    DallE,
    #[serde(rename = "embedding")]
    Embedding,
    #[serde(rename = "claude")]
    Claude,
    #[serde(rename = "claude-haiku")]
    ClaudeHaiku,
    #[serde(rename = "claude-sonnet")]
    ClaudeSonnet,
    #[serde(rename = "claude-opus")]
    ClaudeOpus,
    #[serde(rename = "gemini-flash")]
    GeminiFlash,
    #[serde(rename = "gemini-pro")]
    GeminiPro,
}

impl ModelFamily {
    pub const ALL: [ModelFamily; 14] = [
        ModelFamily::Turbo,
        ModelFamily::TurboInstruct,
        ModelFamily::Gpt4,
        ModelFamily::Gpt4Turbo,
        ModelFamily::Gpt4o,
        ModelFamily::O1,
        ModelFamily::DallE,
        ModelFamily::Embedding,
        ModelFamily::Claude,
        ModelFamily::ClaudeHaiku,
        ModelFamily::ClaudeSonnet,
        ModelFamily::ClaudeOpus,
        ModelFamily::GeminiFlash,
        ModelFamily::GeminiPro,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ModelFamily::Turbo => "turbo",
            ModelFamily::TurboInstruct => "turbo-instruct",
            ModelFamily::Gpt4 => "gpt4",
            ModelFamily::Gpt4Turbo => "gpt4-turbo",
            ModelFamily::Gpt4o => "gpt4o",
            ModelFamily::O1 => "o1",
            ModelFamily::DallE => "dall-e",
            ModelFamily::Embedding => "embedding",
            ModelFamily::Claude => "claude",
            ModelFamily::ClaudeHaiku => "claude-haiku",
            ModelFamily::ClaudeSonnet => "claude-sonnet",
            ModelFamily::ClaudeOpus => "claude-opus",
            ModelFamily::GeminiFlash => "gemini-flash",
            ModelFamily::GeminiPro => "gemini-pro",
        }
    }

    pub fn service(self) -> Service {
        match self {
            ModelFamily::Turbo
            | ModelFamily::TurboInstruct
            | ModelFamily::Gpt4
            | ModelFamily::Gpt4Turbo
            | ModelFamily::Gpt4o
            | ModelFamily::O1
            | ModelFamily::DallE
            | ModelFamily::Embedding => Service::OpenAI,
            ModelFamily::Claude
            | ModelFamily::ClaudeHaiku
            | ModelFamily::ClaudeSonnet
            | ModelFamily::ClaudeOpus => Service::Anthropic,
            ModelFamily::GeminiFlash | ModelFamily::GeminiPro => Service::GoogleAI,
        }
    }

    /// Families whose models reject the legacy text-completion endpoints.
    pub fn is_chat_only(self) -> bool {
        match self {
            ModelFamily::TurboInstruct | ModelFamily::Claude => false,
            ModelFamily::DallE | ModelFamily::Embedding => false,
            _ => true,
        }
    }

    pub fn for_service(service: Service) -> impl Iterator<Item = ModelFamily> {
        ModelFamily::ALL
            .into_iter()
            .filter(move |family| family.service() == service)
    }

    /// Classifies a model id requested on `service`.
    ///
    /// Unknown ids fall back to the service's most restrictive general
    /// purpose family so that access control errs on the side of denying.
    pub fn classify(service: Service, model: &str) -> ModelFamily {
        let model = model.trim().to_ascii_lowercase();
        match service {
            Service::OpenAI => classify_openai(&model),
            Service::Anthropic => classify_anthropic(&model),
            Service::GoogleAI => {
                if model.contains("flash") {
                    ModelFamily::GeminiFlash
                } else {
                    ModelFamily::GeminiPro
                }
            }
        }
    }
}

fn classify_openai(model: &str) -> ModelFamily {
    let model = model.strip_prefix("ft:").unwrap_or(model);
    if model.starts_with("text-embedding") {
        return ModelFamily::Embedding;
    }
    if model.starts_with("dall-e") {
        return ModelFamily::DallE;
    }
    if model.starts_with("o1") {
        return ModelFamily::O1;
    }
    if model.starts_with("gpt-4o") || model.starts_with("chatgpt-4o") {
        return ModelFamily::Gpt4o;
    }
    if model.starts_with("gpt-4-turbo")
        || (model.starts_with("gpt-4") && model.contains("-preview"))
    {
        return ModelFamily::Gpt4Turbo;
    }
    if model.starts_with("gpt-4") {
        return ModelFamily::Gpt4;
    }
    if model.contains("instruct") || model.starts_with("davinci") || model.starts_with("babbage")
    {
        return ModelFamily::TurboInstruct;
    }
    if model.starts_with("gpt-3.5") {
        return ModelFamily::Turbo;
    }
    ModelFamily::Gpt4
}

fn classify_anthropic(model: &str) -> ModelFamily {
    if model.starts_with("claude-2")
        || model.starts_with("claude-instant")
        || model.starts_with("claude-v1")
    {
        return ModelFamily::Claude;
    }
    if model.contains("opus") {
        return ModelFamily::ClaudeOpus;
    }
    if model.contains("haiku") {
        return ModelFamily::ClaudeHaiku;
    }
    ModelFamily::ClaudeSonnet
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelFamily {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ModelFamily::ALL
            .into_iter()
            .find(|family| family.as_str() == value)
            .ok_or_else(|| format!("unknown model family: {value}"))
    }
}

/// Fine-tuned variants carry an `ft:` prefix (`ft:gpt-4o:org::id`) or an
/// `:ft-` infix (legacy `davinci:ft-org-2023`).
pub fn is_fine_tune(model_id: &str) -> bool {
    model_id.starts_with("ft:") || model_id.contains(":ft-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_generation_three_is_chat_only() {
        let legacy = ModelFamily::classify(Service::Anthropic, "claude-2.1");
        assert_eq!(legacy, ModelFamily::Claude);
        assert!(!legacy.is_chat_only());

        let sonnet = ModelFamily::classify(Service::Anthropic, "claude-3-5-sonnet-latest");
        assert_eq!(sonnet, ModelFamily::ClaudeSonnet);
        assert!(sonnet.is_chat_only());

        assert_eq!(
            ModelFamily::classify(Service::Anthropic, "claude-3-opus-20240229"),
            ModelFamily::ClaudeOpus
        );
    }

    #[test]
    fn openai_families() {
        let cases = [
            ("gpt-3.5-turbo", ModelFamily::Turbo),
            ("gpt-3.5-turbo-instruct", ModelFamily::TurboInstruct),
            ("gpt-4-0613", ModelFamily::Gpt4),
            ("gpt-4-turbo-2024-04-09", ModelFamily::Gpt4Turbo),
            ("gpt-4-1106-preview", ModelFamily::Gpt4Turbo),
            ("gpt-4o-mini", ModelFamily::Gpt4o),
            ("o1-preview", ModelFamily::O1),
            ("text-embedding-3-small", ModelFamily::Embedding),
            ("ft:gpt-4o:acme::abc", ModelFamily::Gpt4o),
        ];
        for (model, family) in cases {
            assert_eq!(ModelFamily::classify(Service::OpenAI, model), family, "{model}");
        }
    }

    #[test]
    fn family_names_round_trip_through_from_str() {
        for family in ModelFamily::ALL {
            assert_eq!(family.as_str().parse::<ModelFamily>(), Ok(family));
        }
    }

    #[test]
    fn fine_tunes_are_detected() {
        assert!(is_fine_tune("ft:gpt-3.5-turbo:acme::x1"));
        assert!(is_fine_tune("davinci:ft-acme-2023-01-01"));
        assert!(!is_fine_tune("gpt-4o"));
    }
}
