//! Ordered stage registry with a static field-contract check.
//!
//! Each stage declares which PipelineState fields it reads and writes. The
//! builder validates the declarations against the stages registered before
//! it, so cross-stage field corruption is caught at construction, not at
//! run time. A field is frozen once a stage has read it; a field an earlier
//! stage wrote may only be rewritten by a stage that also reads it (an
//! in-place transformation, like sanitization).

use std::fmt;

use super::stages::Stage;
use super::state::StateField;
use super::RegistryError;
use crate::resource::ResourceClass;

/// One registered stage and its declared contract.
pub struct StageSpec {
    pub name: &'static str,
    /// None for lightweight middleware that needs no device lease.
    pub resource_class: Option<ResourceClass>,
    pub reads: Vec<StateField>,
    pub writes: Vec<StateField>,
    /// Gated stages run only after an Approved decision.
    pub gated: bool,
    stage: Box<dyn Stage>,
}

impl StageSpec {
    pub fn new(
        name: &'static str,
        resource_class: Option<ResourceClass>,
        reads: Vec<StateField>,
        writes: Vec<StateField>,
        gated: bool,
        stage: Box<dyn Stage>,
    ) -> Self {
        Self {
            name,
            resource_class,
            reads,
            writes,
            gated,
            stage,
        }
    }

    pub fn stage(&self) -> &dyn Stage {
        self.stage.as_ref()
    }
}

/// Immutable, ordered stage sequence. Built once at startup.
pub struct StageRegistry {
    specs: Vec<StageSpec>,
}

impl StageRegistry {
    pub fn builder() -> StageRegistryBuilder {
        StageRegistryBuilder { specs: Vec::new() }
    }

    /// Stages that run before the approval gate, in registration order.
    pub fn pre_gate(&self) -> impl Iterator<Item = &StageSpec> {
        self.specs.iter().filter(|s| !s.gated)
    }

    /// Stages that run only after an Approved decision.
    pub fn post_gate(&self) -> impl Iterator<Item = &StageSpec> {
        self.specs.iter().filter(|s| s.gated)
    }

    pub fn get(&self, name: &str) -> Option<&StageSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

pub struct StageRegistryBuilder {
    specs: Vec<StageSpec>,
}

impl fmt::Debug for StageRegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageRegistryBuilder")
            .field("stages", &self.specs.iter().map(|s| s.name).collect::<Vec<_>>())
            .finish()
    }
}

impl StageRegistryBuilder {
    /// Register the next stage in pipeline order.
    pub fn register(mut self, spec: StageSpec) -> Result<Self, RegistryError> {
        if self.specs.iter().any(|s| s.name == spec.name) {
            return Err(RegistryError::DuplicateStage(spec.name.to_string()));
        }
        if !spec.gated && self.specs.iter().any(|s| s.gated) {
            return Err(RegistryError::GatedOrder(spec.name.to_string()));
        }

        for field in &spec.writes {
            for earlier in &self.specs {
                // Read fields are frozen for all later stages.
                if earlier.reads.contains(field) {
                    return Err(RegistryError::WriteConflict {
                        stage: spec.name.to_string(),
                        field: *field,
                        earlier: earlier.name.to_string(),
                    });
                }
                // Rewriting an earlier write is allowed only as an
                // in-place transformation (writer also reads the field).
                if earlier.writes.contains(field) && !spec.reads.contains(field) {
                    return Err(RegistryError::WriteConflict {
                        stage: spec.name.to_string(),
                        field: *field,
                        earlier: earlier.name.to_string(),
                    });
                }
            }
        }

        self.specs.push(spec);
        Ok(self)
    }

    pub fn build(self) -> StageRegistry {
        StageRegistry { specs: self.specs }
    }
}
