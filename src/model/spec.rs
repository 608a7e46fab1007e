use crate::error::FabricError;
use crate::resolver::CollectionResolver;
use crate::sequence::SequenceOptions;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SegregationKind {
    /// Single-organization collection.
    Private,
    /// Collection readable by several organizations.
    Shared,
}

impl fmt::Display for SegregationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegregationKind::Private => write!(f, "private"),
            SegregationKind::Shared => write!(f, "shared"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegregationDescriptor {
    pub kind: SegregationKind,
    pub resolver: CollectionResolver,
}

impl SegregationDescriptor {
    pub fn private(resolver: impl Into<CollectionResolver>) -> Self {
        Self {
            kind: SegregationKind::Private,
            resolver: resolver.into(),
        }
    }

    pub fn shared(resolver: impl Into<CollectionResolver>) -> Self {
        Self {
            kind: SegregationKind::Shared,
            resolver: resolver.into(),
        }
    }

    pub fn group_key(&self) -> String {
        format!("{}:{}", self.kind, self.resolver.group_key())
    }
}

pub type MirrorCondition = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Full-replica routing for organizations matching `condition`.
#[derive(Clone)]
pub struct MirrorSpec {
    pub resolver: CollectionResolver,
    /// Organization the mirror is kept for.
    pub msp_id: String,
    pub condition: MirrorCondition,
}

impl MirrorSpec {
    /// Mirror read by exactly `msp_id`.
    pub fn new(resolver: impl Into<CollectionResolver>, msp_id: impl Into<String>) -> Self {
        let msp_id = msp_id.into();
        let target = msp_id.clone();
        Self {
            resolver: resolver.into(),
            msp_id,
            condition: Arc::new(move |msp| msp == target),
        }
    }

    pub fn with_condition(mut self, condition: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.condition = Arc::new(condition);
        self
    }

    pub fn applies_to(&self, msp_id: &str) -> bool {
        (self.condition)(msp_id)
    }
}

impl fmt::Debug for MirrorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MirrorSpec")
            .field("resolver", &self.resolver)
            .field("msp_id", &self.msp_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditFields {
    pub created_at: String,
    pub updated_at: String,
    pub version: String,
    pub created_by: String,
    pub updated_by: String,
}

impl Default for AuditFields {
    fn default() -> Self {
        Self {
            created_at: "createdAt".into(),
            updated_at: "updatedAt".into(),
            version: "version".into(),
            created_by: "createdBy".into(),
            updated_by: "updatedBy".into(),
        }
    }
}

impl AuditFields {
    pub fn names(&self) -> [&str; 5] {
        [
            &self.created_at,
            &self.updated_at,
            &self.version,
            &self.created_by,
            &self.updated_by,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub column: Option<String>,
    pub transient: bool,
    pub required: bool,
    pub segregation: Vec<SegregationDescriptor>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column: None,
            transient: false,
            required: false,
            segregation: Vec::new(),
        }
    }

    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn private(mut self, resolver: impl Into<CollectionResolver>) -> Self {
        push_unique(&mut self.segregation, SegregationDescriptor::private(resolver));
        self
    }

    pub fn shared(mut self, resolver: impl Into<CollectionResolver>) -> Self {
        push_unique(&mut self.segregation, SegregationDescriptor::shared(resolver));
        self
    }
}

fn push_unique(list: &mut Vec<SegregationDescriptor>, item: SegregationDescriptor) {
    if !list.contains(&item) {
        list.push(item);
    }
}

/// Fields routed to one collection by one resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegregationGroup {
    pub key: String,
    pub kind: SegregationKind,
    pub resolver: CollectionResolver,
    pub fields: Vec<String>,
}

/// Declarative description of one model: table, key, columns and routing.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub name: String,
    pub table: String,
    pub primary_key: String,
    pub pk_sequence: Option<SequenceOptions>,
    pub owned_by: Option<String>,
    pub mirror: Option<MirrorSpec>,
    pub audit: Option<AuditFields>,
    pub events: bool,
    fields: Vec<FieldSpec>,
    class_segregation: Vec<SegregationDescriptor>,
}

impl ModelSpec {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            table: name.to_lowercase(),
            name,
            primary_key: "id".to_string(),
            pk_sequence: None,
            owned_by: None,
            mirror: None,
            audit: None,
            events: true,
            fields: Vec::new(),
            class_segregation: Vec::new(),
        }
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn primary_key(mut self, field: impl Into<String>) -> Self {
        self.primary_key = field.into();
        self
    }

    /// Primary keys left empty on create are drawn from this sequence.
    pub fn pk_sequence(mut self, options: SequenceOptions) -> Self {
        self.pk_sequence = Some(options);
        self
    }

    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.fields.push(FieldSpec::new(name));
        self
    }

    pub fn add_field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    pub fn private_field(self, name: impl Into<String>, resolver: impl Into<CollectionResolver>) -> Self {
        self.add_field(FieldSpec::new(name).private(resolver))
    }

    pub fn shared_field(self, name: impl Into<String>, resolver: impl Into<CollectionResolver>) -> Self {
        self.add_field(FieldSpec::new(name).shared(resolver))
    }

    pub fn transient_field(self, name: impl Into<String>) -> Self {
        self.add_field(FieldSpec::new(name).transient())
    }

    /// Marks every declared property (except key and audit fields) private,
    /// unless the property carries its own marker.
    pub fn private_class(mut self, resolver: impl Into<CollectionResolver>) -> Self {
        push_unique(
            &mut self.class_segregation,
            SegregationDescriptor::private(resolver),
        );
        self
    }

    pub fn shared_class(mut self, resolver: impl Into<CollectionResolver>) -> Self {
        push_unique(
            &mut self.class_segregation,
            SegregationDescriptor::shared(resolver),
        );
        self
    }

    pub fn owned_by(mut self, field: impl Into<String>) -> Self {
        self.owned_by = Some(field.into());
        self
    }

    pub fn mirror(mut self, mirror: MirrorSpec) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn audited(mut self) -> Self {
        self.audit = Some(AuditFields::default());
        self
    }

    pub fn events(mut self, events: bool) -> Self {
        self.events = events;
        self
    }

    pub fn validate(&self) -> Result<(), FabricError> {
        if self.table.is_empty() {
            return Err(FabricError::invalid_config(format!(
                "model '{}' must define a table",
                self.name
            )));
        }
        let mut names = BTreeSet::new();
        for f in &self.fields {
            if !names.insert(f.name.as_str()) {
                return Err(FabricError::invalid_config(format!(
                    "model '{}' declares field '{}' twice",
                    self.name, f.name
                )));
            }
        }
        if let Some(audit) = &self.audit {
            for name in audit.names() {
                if names.contains(name) {
                    return Err(FabricError::invalid_config(format!(
                        "model '{}' field '{name}' collides with an audit field",
                        self.name
                    )));
                }
            }
        }
        if let Some(pk) = self.field_spec(&self.primary_key) {
            if !pk.segregation.is_empty() || pk.transient {
                return Err(FabricError::invalid_config(format!(
                    "primary key '{}' of model '{}' cannot be segregated or transient",
                    self.primary_key, self.name
                )));
            }
        }
        if let Some(owner) = &self.owned_by {
            if !names.contains(owner.as_str()) {
                return Err(FabricError::invalid_config(format!(
                    "owned_by field '{owner}' is not declared on model '{}'",
                    self.name
                )));
            }
        }
        let mut columns = BTreeMap::new();
        for field in self.all_fields() {
            let column = self.column(&field);
            if let Some(previous) = columns.insert(column.clone(), field.clone()) {
                return Err(FabricError::invalid_config(format!(
                    "fields '{previous}' and '{field}' of model '{}' map to the same column '{column}'",
                    self.name
                )));
            }
        }
        if let Some(seq) = &self.pk_sequence {
            seq.validate()?;
        }
        Ok(())
    }

    pub fn field_spec(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn declared_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter()
    }

    /// Every persisted attribute name: key, declared fields, audit fields.
    pub fn all_fields(&self) -> Vec<String> {
        let mut out = vec![self.primary_key.clone()];
        for f in &self.fields {
            if f.name != self.primary_key {
                out.push(f.name.clone());
            }
        }
        if let Some(audit) = &self.audit {
            out.extend(audit.names().iter().map(|n| n.to_string()));
        }
        out
    }

    pub fn is_audit_field(&self, name: &str) -> bool {
        self.audit
            .as_ref()
            .is_some_and(|a| a.names().contains(&name))
    }

    /// Stored column name for a model field.
    pub fn column(&self, field: &str) -> String {
        self.field_spec(field)
            .and_then(|f| f.column.clone())
            .unwrap_or_else(|| field.to_string())
    }

    /// Model field name for a stored column.
    pub fn field_for_column(&self, column: &str) -> String {
        self.fields
            .iter()
            .find(|f| f.column.as_deref() == Some(column))
            .map(|f| f.name.clone())
            .unwrap_or_else(|| column.to_string())
    }

    /// Effective segregation of a field: its own markers, else the class's.
    pub fn segregation_of(&self, field: &str) -> &[SegregationDescriptor] {
        if field == self.primary_key || self.is_audit_field(field) {
            return &[];
        }
        match self.field_spec(field) {
            Some(f) if !f.segregation.is_empty() => &f.segregation,
            Some(f) if f.transient => &[],
            Some(_) => &self.class_segregation,
            None => &[],
        }
    }

    pub fn is_segregated(&self) -> bool {
        self.fields
            .iter()
            .any(|f| !self.segregation_of(&f.name).is_empty())
    }

    pub fn is_transient(&self, field: &str) -> bool {
        self.field_spec(field).is_some_and(|f| f.transient)
    }

    /// Groups segregated fields by marker identity, in declaration order.
    pub fn segregation_groups(&self) -> Vec<SegregationGroup> {
        let mut groups: Vec<SegregationGroup> = Vec::new();
        for field in &self.fields {
            for desc in self.segregation_of(&field.name) {
                let key = desc.group_key();
                match groups.iter_mut().find(|g| g.key == key) {
                    Some(group) => group.fields.push(field.name.clone()),
                    None => groups.push(SegregationGroup {
                        key,
                        kind: desc.kind,
                        resolver: desc.resolver.clone(),
                        fields: vec![field.name.clone()],
                    }),
                }
            }
        }
        groups
    }

    /// Fields that stay in the world-state record, excluding key and audit
    /// fields. Empty means the model is fully segregated.
    pub fn public_remainder(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter(|f| f.name != self.primary_key)
            .filter(|f| !f.transient && self.segregation_of(&f.name).is_empty())
            .map(|f| f.name.clone())
            .collect()
    }

    pub fn is_fully_segregated(&self) -> bool {
        self.is_segregated() && self.public_remainder().is_empty()
    }

    pub fn pk_sequence_name(&self) -> Option<String> {
        self.pk_sequence.as_ref().map(|s| {
            s.name
                .clone()
                .unwrap_or_else(|| format!("{}_pk", self.table))
        })
    }
}
