use crate::context::Context;
use crate::error::FabricError;
use std::fmt;
use std::sync::Arc;

pub type ResolverFn =
    Arc<dyn Fn(&str, Option<&str>, &Context) -> Result<String, FabricError> + Send + Sync>;

/// How a segregated field finds its collection.
///
/// Every strategy is a deterministic function of (model name, organization),
/// so the collection chosen when writing is the one consulted when reading.
#[derive(Clone)]
pub enum CollectionResolver {
    /// A literal collection name.
    Named(String),
    /// `__{Org}PrivateCollection`.
    ImplicitPrivate,
    /// `{namespace}{Org}`.
    Namespace(String),
    /// `{Model}{Org}`.
    Model,
    /// Caller-supplied function; `id` names it for grouping and diagnostics.
    Custom { id: String, resolve: ResolverFn },
}

impl fmt::Debug for CollectionResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.group_key())
    }
}

impl PartialEq for CollectionResolver {
    fn eq(&self, other: &Self) -> bool {
        self.group_key() == other.group_key()
    }
}

impl Eq for CollectionResolver {}

impl From<&str> for CollectionResolver {
    fn from(name: &str) -> Self {
        CollectionResolver::Named(name.to_string())
    }
}

impl From<String> for CollectionResolver {
    fn from(name: String) -> Self {
        CollectionResolver::Named(name)
    }
}

impl CollectionResolver {
    pub fn custom(
        id: impl Into<String>,
        resolve: impl Fn(&str, Option<&str>, &Context) -> Result<String, FabricError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        CollectionResolver::Custom {
            id: id.into(),
            resolve: Arc::new(resolve),
        }
    }

    /// Identity used to keep hook groups of unrelated resolvers apart.
    pub fn group_key(&self) -> String {
        match self {
            CollectionResolver::Named(name) => format!("named:{name}"),
            CollectionResolver::ImplicitPrivate => "implicit-private".to_string(),
            CollectionResolver::Namespace(ns) => format!("namespace:{ns}"),
            CollectionResolver::Model => "model".to_string(),
            CollectionResolver::Custom { id, .. } => format!("custom:{id}"),
        }
    }

    /// Literal resolvers don't depend on the organization.
    pub fn needs_org(&self) -> bool {
        !matches!(self, CollectionResolver::Named(_))
    }

    pub fn resolve(
        &self,
        model_name: &str,
        org: Option<&str>,
        ctx: &Context,
    ) -> Result<String, FabricError> {
        match self {
            CollectionResolver::Named(name) => Ok(name.clone()),
            CollectionResolver::ImplicitPrivate => {
                let org = require_org(org, model_name)?;
                Ok(format!("__{}PrivateCollection", pascal_case(org)))
            }
            CollectionResolver::Namespace(ns) => {
                let org = require_org(org, model_name)?;
                Ok(format!("{ns}{}", pascal_case(org)))
            }
            CollectionResolver::Model => {
                let org = require_org(org, model_name)?;
                Ok(format!("{}{}", pascal_case(model_name), pascal_case(org)))
            }
            CollectionResolver::Custom { resolve, .. } => resolve(model_name, org, ctx),
        }
    }
}

fn require_org<'a>(org: Option<&'a str>, model_name: &str) -> Result<&'a str, FabricError> {
    org.filter(|o| !o.is_empty()).ok_or_else(|| {
        FabricError::invalid_config(format!(
            "cannot resolve collection for '{model_name}': no owning organization"
        ))
    })
}

/// `main-org` -> `MainOrg`, `Org1MSP` -> `Org1MSP`, `order_item` -> `OrderItem`.
pub fn pascal_case(input: &str) -> String {
    input
        .split(|c: char| !c.is_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}
