//! JSON shapes emitted by the provisioning tool in `compactjson` mode.

use serde::Deserialize;

use super::{InstanceHandle, InstanceState, Recipe};

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(super) struct VersionOutput {
    pub(super) version: String,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(super) struct WhoAmIOutput {
    pub(super) auth: AuthSession,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(super) struct AuthSession {
    #[serde(default)]
    pub(super) email: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(super) struct InstanceOutput {
    pub(super) instance: WireInstance,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(super) struct InstanceListOutput {
    #[serde(default)]
    pub(super) instances: Vec<WireInstance>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(super) struct RecipeListOutput {
    #[serde(default)]
    pub(super) recipes: Vec<Recipe>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(super) struct WireInstance {
    uuid: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    adb_serial: Option<String>,
    #[serde(default)]
    recipe: Option<WireRecipeRef>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
struct WireRecipeRef {
    uuid: String,
}

impl From<WireInstance> for InstanceHandle {
    fn from(value: WireInstance) -> Self {
        Self {
            state: InstanceState::parse(&value.state),
            uuid: value.uuid,
            name: value.name,
            adb_name: value.adb_serial.unwrap_or_default(),
            recipe_uuid: value.recipe.map(|recipe| recipe.uuid),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(super) struct ErrorOutput {
    pub(super) error: ErrorBody,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(super) struct ErrorBody {
    #[serde(default)]
    pub(super) message: String,
    #[serde(default)]
    pub(super) details: Option<String>,
}

/// Extracts the most useful diagnostic from a failed invocation.
///
/// Structured `{"error": {...}}` payloads are flattened; anything else is
/// returned verbatim.
pub(super) fn diagnostic_text(stdout: &str, stderr: &str) -> String {
    for stream in [stderr, stdout] {
        if let Ok(parsed) = serde_json::from_str::<ErrorOutput>(stream.trim()) {
            return match parsed.error.details {
                Some(details) if !details.trim().is_empty() => {
                    format!("{} ({})", parsed.error.message, details.trim())
                }
                _ => parsed.error.message,
            };
        }
    }
    let stderr_trimmed = stderr.trim();
    if stderr_trimmed.is_empty() {
        stdout.trim().to_owned()
    } else {
        stderr_trimmed.to_owned()
    }
}
