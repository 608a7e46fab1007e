use crate::error::FabricError;
use std::collections::BTreeSet;
use std::time::Duration;

/// Field added to every stored record naming the table it belongs to, so
/// structured queries can be scoped to a single model.
pub const DEFAULT_TABLE_FIELD: &str = "??table";

/// Runtime configuration for a storage adapter.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub reserved_fields: BTreeSet<String>,
    pub table_field: String,
    pub emit_events: bool,
    /// `None` retries UUID sequence conflicts until a write wins.
    pub uuid_retry_limit: Option<u32>,
    pub default_page_size: usize,
    pub max_page_size: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            reserved_fields: ["_id", "_rev", DEFAULT_TABLE_FIELD]
                .into_iter()
                .map(str::to_string)
                .collect(),
            table_field: DEFAULT_TABLE_FIELD.to_string(),
            emit_events: true,
            uuid_retry_limit: None,
            default_page_size: 25,
            max_page_size: 1000,
        }
    }
}

impl AdapterConfig {
    /// Profile used inside chaincode: events on, unbounded UUID retry.
    pub fn chaincode() -> Self {
        Self::default()
    }

    /// Profile for tooling and replay where ledger events are meaningless.
    pub fn offline() -> Self {
        Self {
            emit_events: false,
            ..Self::default()
        }
    }

    pub fn with_uuid_retry_limit(mut self, limit: u32) -> Self {
        self.uuid_retry_limit = Some(limit);
        self
    }

    pub fn with_reserved_field(mut self, field: impl Into<String>) -> Self {
        self.reserved_fields.insert(field.into());
        self
    }

    pub fn with_events(mut self, emit_events: bool) -> Self {
        self.emit_events = emit_events;
        self
    }

    pub fn is_reserved(&self, field: &str) -> bool {
        self.reserved_fields.contains(field)
    }

    pub fn validate(&self) -> Result<(), FabricError> {
        if self.table_field.is_empty() {
            return Err(FabricError::invalid_config("table_field must not be empty"));
        }
        if !self.reserved_fields.contains(&self.table_field) {
            return Err(FabricError::invalid_config(format!(
                "table_field '{}' must be listed in reserved_fields",
                self.table_field
            )));
        }
        if self.default_page_size == 0 || self.max_page_size == 0 {
            return Err(FabricError::invalid_config("page sizes must be > 0"));
        }
        if self.default_page_size > self.max_page_size {
            return Err(FabricError::invalid_config(format!(
                "default_page_size {} exceeds max_page_size {}",
                self.default_page_size, self.max_page_size
            )));
        }
        Ok(())
    }

    pub fn clamp_page_size(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_page_size)
            .clamp(1, self.max_page_size)
    }
}

/// Per-call deadlines for gateway round trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayDeadlines {
    pub evaluate: Duration,
    pub endorse: Duration,
    pub submit: Duration,
    pub commit_status: Duration,
}

impl Default for GatewayDeadlines {
    fn default() -> Self {
        Self {
            evaluate: Duration::from_secs(5),
            endorse: Duration::from_secs(15),
            submit: Duration::from_secs(5),
            commit_status: Duration::from_secs(60),
        }
    }
}

/// Client-side connection settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub channel: String,
    pub chaincode: String,
    pub contract: Option<String>,
    pub deadlines: GatewayDeadlines,
}

impl GatewayConfig {
    pub fn new(channel: impl Into<String>, chaincode: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            chaincode: chaincode.into(),
            contract: None,
            deadlines: GatewayDeadlines::default(),
        }
    }

    pub fn contract(mut self, contract: impl Into<String>) -> Self {
        self.contract = Some(contract.into());
        self
    }

    pub fn deadlines(mut self, deadlines: GatewayDeadlines) -> Self {
        self.deadlines = deadlines;
        self
    }

    pub fn validate(&self) -> Result<(), FabricError> {
        if self.channel.is_empty() || self.chaincode.is_empty() {
            return Err(FabricError::invalid_config(
                "gateway channel and chaincode must be set",
            ));
        }
        let d = &self.deadlines;
        if [d.evaluate, d.endorse, d.submit, d.commit_status]
            .iter()
            .any(Duration::is_zero)
        {
            return Err(FabricError::invalid_config(
                "gateway deadlines must be non-zero",
            ));
        }
        Ok(())
    }
}
