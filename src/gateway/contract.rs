use crate::context::Context;
use crate::error::FabricError;
use crate::model::{Model, Record, from_record};
use crate::query::MangoQuery;
use crate::repository::Repository;
use serde::Serialize;
use tracing::debug;

/// Functions a serialized CRUD contract exposes to gateway clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContractFunction {
    Create,
    Read,
    Update,
    Delete,
    CreateAll,
    ReadAll,
    UpdateAll,
    DeleteAll,
    Query,
}

impl ContractFunction {
    pub fn as_str(self) -> &'static str {
        match self {
            ContractFunction::Create => "create",
            ContractFunction::Read => "read",
            ContractFunction::Update => "update",
            ContractFunction::Delete => "delete",
            ContractFunction::CreateAll => "createAll",
            ContractFunction::ReadAll => "readAll",
            ContractFunction::UpdateAll => "updateAll",
            ContractFunction::DeleteAll => "deleteAll",
            ContractFunction::Query => "query",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "create" => ContractFunction::Create,
            "read" => ContractFunction::Read,
            "update" => ContractFunction::Update,
            "delete" => ContractFunction::Delete,
            "createAll" => ContractFunction::CreateAll,
            "readAll" => ContractFunction::ReadAll,
            "updateAll" => ContractFunction::UpdateAll,
            "deleteAll" => ContractFunction::DeleteAll,
            "query" => ContractFunction::Query,
            _ => return None,
        })
    }

    /// Whether the call changes ledger state.
    pub fn is_submit(self) -> bool {
        matches!(
            self,
            ContractFunction::Create
                | ContractFunction::Update
                | ContractFunction::Delete
                | ContractFunction::CreateAll
                | ContractFunction::UpdateAll
                | ContractFunction::DeleteAll
        )
    }
}

/// Chaincode-side entry point: decodes string arguments, runs the matching
/// repository operation and encodes the result as JSON bytes.
pub struct SerializedContract<M: Model> {
    repo: Repository<M>,
}

impl<M: Model> SerializedContract<M> {
    pub fn new(repo: Repository<M>) -> Self {
        Self { repo }
    }

    pub fn repository(&self) -> &Repository<M> {
        &self.repo
    }

    pub async fn invoke(
        &self,
        function: &str,
        args: &[String],
        ctx: &Context,
    ) -> Result<Vec<u8>, FabricError> {
        let func = ContractFunction::parse(function).ok_or_else(|| {
            FabricError::Validation(format!("unknown contract function '{function}'"))
        })?;
        let arg = args.first().map(String::as_str).ok_or_else(|| {
            FabricError::Validation(format!("'{function}' expects one argument"))
        })?;
        debug!(function, model = %self.repo.spec().name, "contract invocation");
        match func {
            ContractFunction::Create => encode(&self.repo.create(decode_model(arg)?, ctx).await?),
            ContractFunction::Read => encode(&self.repo.read(arg, ctx).await?),
            ContractFunction::Update => encode(&self.repo.update(decode_model(arg)?, ctx).await?),
            ContractFunction::Delete => encode(&self.repo.delete(arg, ctx).await?),
            ContractFunction::CreateAll => {
                encode(&self.repo.create_all(decode_models(arg)?, ctx).await?)
            }
            ContractFunction::ReadAll => {
                let ids: Vec<String> = serde_json::from_str(arg)?;
                let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
                encode(&self.repo.read_all(&ids, ctx).await?)
            }
            ContractFunction::UpdateAll => {
                encode(&self.repo.update_all(decode_models(arg)?, ctx).await?)
            }
            ContractFunction::DeleteAll => {
                let ids: Vec<String> = serde_json::from_str(arg)?;
                let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
                encode(&self.repo.delete_all(&ids, ctx).await?)
            }
            ContractFunction::Query => {
                let mango = MangoQuery::parse(arg)?;
                encode(&self.repo.query_mango(&mango, ctx).await?)
            }
        }
    }
}

fn decode_model<M: Model>(raw: &str) -> Result<M, FabricError> {
    from_record(serde_json::from_str::<Record>(raw)?)
}

fn decode_models<M: Model>(raw: &str) -> Result<Vec<M>, FabricError> {
    serde_json::from_str::<Vec<Record>>(raw)?
        .into_iter()
        .map(from_record)
        .collect()
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, FabricError> {
    Ok(serde_json::to_vec(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_names_round_trip_and_classify() {
        for f in [
            ContractFunction::Create,
            ContractFunction::ReadAll,
            ContractFunction::Query,
        ] {
            assert_eq!(ContractFunction::parse(f.as_str()), Some(f));
        }
        assert!(ContractFunction::DeleteAll.is_submit());
        assert!(!ContractFunction::Query.is_submit());
        assert_eq!(ContractFunction::parse("drop"), None);
    }
}
