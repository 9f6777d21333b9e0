//! Resolution of device queries to provisionable recipes.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::command::CommandRunner;
use crate::provider::{CliProvider, ProvisioningError, Recipe};

/// Raised when a device query cannot be turned into exactly one recipe.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigurationError {
    /// Raised when nothing matches the query.
    #[error("no recipe matches device query '{query}': {hint}")]
    NoMatch {
        /// Query supplied by the caller.
        query: String,
        /// How to fix the query.
        hint: String,
    },
    /// Raised when several recipes match and none is an exact name match.
    #[error("device query '{query}' matches several recipes ({candidates}): {hint}")]
    Ambiguous {
        /// Query supplied by the caller.
        query: String,
        /// Comma separated recipe names.
        candidates: String,
        /// How to fix the query.
        hint: String,
    },
    /// Raised when the recipe catalogue cannot be queried.
    #[error("failed to look up recipes for '{query}': {source}")]
    Lookup {
        /// Query supplied by the caller.
        query: String,
        /// Underlying provider failure.
        #[source]
        source: ProvisioningError,
    },
}

/// Future returned by [`RecipeResolver::resolve`].
pub type ResolveFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Recipe, ConfigurationError>> + Send + 'a>>;

/// Maps a device query to a recipe.
pub trait RecipeResolver {
    /// Resolves `query` to exactly one recipe.
    fn resolve<'a>(&'a self, query: &'a str) -> ResolveFuture<'a>;
}

/// Resolves queries by recipe name through the provisioning tool.
#[derive(Clone, Debug)]
pub struct ProviderRecipeResolver<R: CommandRunner> {
    provider: CliProvider<R>,
}

impl<R: CommandRunner> ProviderRecipeResolver<R> {
    /// Creates a resolver backed by `provider`.
    #[must_use]
    pub const fn new(provider: CliProvider<R>) -> Self {
        Self { provider }
    }

    fn hint(&self) -> String {
        format!(
            "run '{} recipes list' to see available recipes and use an exact name",
            self.provider.program()
        )
    }
}

/// Picks the single recipe matching `query`.
///
/// One result wins outright; among several, a case-insensitive exact name
/// match wins.
///
/// # Errors
///
/// Returns [`ConfigurationError::NoMatch`] or
/// [`ConfigurationError::Ambiguous`].
pub fn select_recipe(
    query: &str,
    recipes: Vec<Recipe>,
    hint: &str,
) -> Result<Recipe, ConfigurationError> {
    let wanted = query.trim();
    let names = recipes
        .iter()
        .map(|recipe| recipe.name.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    let mut exact = recipes
        .iter()
        .filter(|recipe| recipe.name.eq_ignore_ascii_case(wanted))
        .cloned()
        .collect::<Vec<_>>();
    let mut all = recipes.into_iter();

    match (all.next(), all.next()) {
        (Some(only), None) => Ok(only),
        (None, _) => Err(ConfigurationError::NoMatch {
            query: query.to_owned(),
            hint: hint.to_owned(),
        }),
        (Some(_), Some(_)) if exact.len() == 1 => exact.pop().ok_or_else(|| {
            ConfigurationError::NoMatch {
                query: query.to_owned(),
                hint: hint.to_owned(),
            }
        }),
        (Some(_), Some(_)) => Err(ConfigurationError::Ambiguous {
            query: query.to_owned(),
            candidates: names,
            hint: hint.to_owned(),
        }),
    }
}

impl<R> RecipeResolver for ProviderRecipeResolver<R>
where
    R: CommandRunner + Send + Sync,
{
    fn resolve<'a>(&'a self, query: &'a str) -> ResolveFuture<'a> {
        Box::pin(async move {
            let recipes = self
                .provider
                .recipes_by_name(query.trim())
                .await
                .map_err(|source| ConfigurationError::Lookup {
                    query: query.to_owned(),
                    source,
                })?;
            select_recipe(query, recipes, &self.hint())
        })
    }
}
