//! Tree mutations and the cascade that keeps content caches and satellites in step with them.
//!
//! Every public mutation follows the same phase sequence: the tree document is written first
//! (`Mutating`), then the target and each captured descendant are re-resolved in depth-first
//! pre-order (`ResolvingSelf`, `ResolvingDescendants`), then satellites are reconciled in the same
//! order (`PropagatingSatellites`). A node that fails one of the later phases is reported in
//! [`MutationOutcome::failed`] and the remaining nodes still run. Nothing is rolled back; the
//! failed ids are meant to be fed to [`MutationCoordinator::refresh`].

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::{
    propagate_satellites, resolve_ancestor_chain, resolve_inherited_config_snapshot, AuditEntry,
    AuditSink, ContentId, ContentRecord, ContentStore, EngineConfig, Hierarchy, HierarchyKey,
    MutationKind, Placement, PlacementId, PropagationReport, ResolutionAnomaly, SatelliteKind,
    SatelliteRecord, SatelliteStore, TreeError, TreeStore,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MutationPhase {
    Idle,
    Mutating,
    ResolvingSelf,
    ResolvingDescendants,
    PropagatingSatellites,
}

impl MutationPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Mutating => "mutating",
            Self::ResolvingSelf => "resolving_self",
            Self::ResolvingDescendants => "resolving_descendants",
            Self::PropagatingSatellites => "propagating_satellites",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Applied,
    /// The tree changed but at least one node's caches or satellites could not be rebuilt.
    PartiallyApplied,
    /// The target did not exist; nothing was written.
    NoOp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeFailure {
    pub content_id: ContentId,
    pub phase: MutationPhase,
    pub error: TreeError,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MutationOutcome {
    pub mutation: MutationKind,
    pub key: HierarchyKey,
    pub status: MutationStatus,
    pub content_id: Option<ContentId>,
    pub placement_id: Option<PlacementId>,
    /// Nodes whose caches were rebuilt, in processing order.
    pub affected: Vec<ContentId>,
    pub failed: Vec<NodeFailure>,
    pub anomalies: Vec<ResolutionAnomaly>,
    pub satellites: PropagationReport,
    /// Why a `NoOp` did nothing.
    pub reason: Option<String>,
}

impl MutationOutcome {
    fn new(mutation: MutationKind, key: &HierarchyKey) -> Self {
        Self {
            mutation,
            key: key.clone(),
            status: MutationStatus::Applied,
            content_id: None,
            placement_id: None,
            affected: Vec::new(),
            failed: Vec::new(),
            anomalies: Vec::new(),
            satellites: PropagationReport::default(),
            reason: None,
        }
    }

    fn no_op(mut self, reason: &TreeError) -> Self {
        tracing::debug!(
            owner_id = %self.key.owner_id,
            branch = %self.key.branch,
            mutation = self.mutation.as_str(),
            reason = %reason,
            "mutation target missing; nothing to do"
        );
        self.status = MutationStatus::NoOp;
        self.reason = Some(reason.to_string());
        self
    }

    fn fail(&mut self, content_id: &ContentId, phase: MutationPhase, error: TreeError) {
        tracing::warn!(
            owner_id = %self.key.owner_id,
            branch = %self.key.branch,
            content_id = %content_id,
            phase = phase.as_str(),
            error = %error,
            "node pass failed; continuing with remaining nodes"
        );
        self.failed.push(NodeFailure { content_id: content_id.clone(), phase, error });
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Distinct ids of failed nodes, ready for a refresh.
    #[must_use]
    pub fn failed_content_ids(&self) -> Vec<ContentId> {
        let mut seen = BTreeSet::new();
        self.failed
            .iter()
            .filter(|failure| seen.insert(failure.content_id.clone()))
            .map(|failure| failure.content_id.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateNode {
    pub parent: PlacementId,
    pub content_id: ContentId,
    pub is_category: bool,
    #[serde(default)]
    pub local_config: Option<Value>,
    #[serde(default)]
    pub category_config: Option<Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct MoveNode {
    pub placement_id: PlacementId,
    pub new_parent: PlacementId,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "by", content = "id", rename_all = "snake_case")]
pub enum RemoveTarget {
    Placement(PlacementId),
    /// Removes the placement of this content if it is placed, otherwise the content record and
    /// its parent-pointer subtree.
    Content(ContentId),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RemoveNode {
    pub target: RemoveTarget,
    /// Physically delete the removed records and every satellite they own.
    #[serde(default)]
    pub purge: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateConfig {
    pub content_id: ContentId,
    pub local_config: Value,
    #[serde(default)]
    pub category_config: Option<Value>,
}

/// Single-writer orchestrator over one store handle.
pub struct MutationCoordinator<'a, S: ?Sized> {
    store: &'a mut S,
    config: EngineConfig,
    audit: &'a dyn AuditSink,
    operator: String,
    phase: MutationPhase,
}

impl<'a, S> MutationCoordinator<'a, S>
where
    S: TreeStore + ContentStore + SatelliteStore + ?Sized,
{
    /// # Errors
    /// Returns [`TreeError::Validation`] for an invalid config or a blank operator.
    pub fn new(
        store: &'a mut S,
        config: EngineConfig,
        audit: &'a dyn AuditSink,
        operator: impl Into<String>,
    ) -> Result<Self, TreeError> {
        config.validate()?;
        let operator = operator.into();
        if operator.trim().is_empty() {
            return Err(TreeError::Validation(
                "operator MUST be provided for every mutation".to_string(),
            ));
        }
        Ok(Self { store, config, audit, operator, phase: MutationPhase::Idle })
    }

    #[must_use]
    pub fn phase(&self) -> MutationPhase {
        self.phase
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Create the hierarchy document with its root placement and root category record.
    ///
    /// # Errors
    /// Returns [`TreeError::Validation`] when the hierarchy already exists.
    pub fn init_hierarchy(
        &mut self,
        key: &HierarchyKey,
        root_content_id: ContentId,
    ) -> Result<Hierarchy, TreeError> {
        let result = self.init_hierarchy_inner(key, root_content_id);
        self.finish(key, result)
    }

    /// # Errors
    /// Returns [`TreeError::Validation`] for malformed requests, a non-category parent, or
    /// content that is already placed. A missing hierarchy or parent placement is a `NoOp`.
    pub fn create_node(
        &mut self,
        key: &HierarchyKey,
        request: CreateNode,
    ) -> Result<MutationOutcome, TreeError> {
        let result = self.create_node_inner(key, request);
        self.finish(key, result)
    }

    /// # Errors
    /// Returns [`TreeError::Validation`] when moving the root, moving a node beneath itself,
    /// or targeting a non-category parent. Missing placements are a `NoOp`.
    pub fn move_node(
        &mut self,
        key: &HierarchyKey,
        request: MoveNode,
    ) -> Result<MutationOutcome, TreeError> {
        let result = self.move_node_inner(key, request);
        self.finish(key, result)
    }

    /// # Errors
    /// Returns [`TreeError::Validation`] when targeting the root placement.
    pub fn remove_node(
        &mut self,
        key: &HierarchyKey,
        request: RemoveNode,
    ) -> Result<MutationOutcome, TreeError> {
        let result = self.remove_node_inner(key, request);
        self.finish(key, result)
    }

    /// # Errors
    /// Returns [`TreeError::Validation`] when the new configuration is not allowed on the record.
    pub fn update_config(
        &mut self,
        key: &HierarchyKey,
        request: UpdateConfig,
    ) -> Result<MutationOutcome, TreeError> {
        let result = self.update_config_inner(key, request);
        self.finish(key, result)
    }

    /// Re-run the resolver and propagator for `content_ids`. A placed node whose parent pointer
    /// had to be realigned with the tree, or whose record had to be rebuilt from its placement,
    /// pulls its placement descendants into the same pass.
    ///
    /// # Errors
    /// Returns store errors raised while loading the hierarchy.
    pub fn refresh(
        &mut self,
        key: &HierarchyKey,
        content_ids: &[ContentId],
    ) -> Result<MutationOutcome, TreeError> {
        let result = self.refresh_inner(key, content_ids);
        self.finish(key, result)
    }

    /// # Errors
    /// Returns [`TreeError::Validation`] for inherited or duplicate records.
    pub fn add_originating_satellite(
        &mut self,
        record: SatelliteRecord,
    ) -> Result<MutationOutcome, TreeError> {
        let key = record.key.clone();
        let result = self.add_originating_satellite_inner(record);
        self.finish(&key, result)
    }

    /// # Errors
    /// Returns store errors; an unknown record is a `NoOp`.
    pub fn remove_originating_satellite(
        &mut self,
        key: &HierarchyKey,
        kind: SatelliteKind,
        owner: &ContentId,
        record_key: &str,
    ) -> Result<MutationOutcome, TreeError> {
        let result = self.remove_originating_satellite_inner(key, kind, owner, record_key);
        self.finish(key, result)
    }

    fn init_hierarchy_inner(
        &mut self,
        key: &HierarchyKey,
        root_content_id: ContentId,
    ) -> Result<Hierarchy, TreeError> {
        key.validate()?;
        root_content_id.validate()?;
        if self.store.load_hierarchy(key)?.is_some() {
            return Err(TreeError::Validation(format!("hierarchy {key} already exists")));
        }

        self.enter(key, MutationPhase::Mutating);
        let mut hierarchy = Hierarchy::new(key.clone(), root_content_id.clone());
        self.store.save_hierarchy(&mut hierarchy)?;

        let mut root = self
            .store
            .get_content(key, &root_content_id)?
            .unwrap_or_else(|| ContentRecord::new(key.clone(), root_content_id.clone(), true));
        root.is_category = true;
        root.removed = false;
        root.clear_inheritance();
        self.store.put_content(&root)?;

        tracing::info!(
            owner_id = %key.owner_id,
            branch = %key.branch,
            content_id = %root_content_id,
            placement_id = %hierarchy.root.placement_id,
            "hierarchy initialized"
        );
        Ok(hierarchy)
    }

    fn create_node_inner(
        &mut self,
        key: &HierarchyKey,
        request: CreateNode,
    ) -> Result<MutationOutcome, TreeError> {
        key.validate()?;
        request.content_id.validate()?;
        let mut outcome = MutationOutcome::new(MutationKind::Create, key);
        outcome.content_id = Some(request.content_id.clone());

        let Some(mut hierarchy) = self.store.load_hierarchy(key)? else {
            return Ok(outcome.no_op(&missing_hierarchy(key)));
        };
        let parent_category = match category_parent(&hierarchy, request.parent) {
            Ok(parent) => parent,
            Err(err) if err.is_benign() => return Ok(outcome.no_op(&err)),
            Err(err) => return Err(err),
        };
        if hierarchy.find_by_content_id(&request.content_id).is_some() {
            return Err(TreeError::Validation(format!(
                "content {} is already placed in hierarchy {key}",
                request.content_id
            )));
        }
        if hierarchy.depth_of(request.parent).is_some_and(|depth| depth > self.config.max_depth) {
            return Err(TreeError::Validation(format!(
                "placement {} is deeper than max_depth {}; a child there could never resolve",
                request.parent, self.config.max_depth
            )));
        }

        let mut record = self
            .store
            .get_content(key, &request.content_id)?
            .unwrap_or_else(|| {
                ContentRecord::new(key.clone(), request.content_id.clone(), request.is_category)
            });
        record.is_category = request.is_category;
        record.removed = false;
        record.clear_inheritance();
        record.parent_category_id = parent_category;
        if let Some(local_config) = request.local_config {
            record.local_config = local_config;
        }
        if request.category_config.is_some() || !record.is_category {
            record.category_config = request.category_config;
        }
        record.validate()?;

        self.enter(key, MutationPhase::Mutating);
        let placement = Placement::new(request.content_id.clone(), request.is_category);
        let placement_id = placement.placement_id;
        hierarchy.add_child(request.parent, placement)?;
        self.store.save_hierarchy(&mut hierarchy)?;
        outcome.placement_id = Some(placement_id);

        match self.store.put_content(&record) {
            Ok(()) => self.cascade(key, &[request.content_id], true, &mut outcome),
            Err(err) => outcome.fail(&request.content_id, MutationPhase::Mutating, err),
        }
        Ok(self.conclude(outcome))
    }

    fn move_node_inner(
        &mut self,
        key: &HierarchyKey,
        request: MoveNode,
    ) -> Result<MutationOutcome, TreeError> {
        key.validate()?;
        let mut outcome = MutationOutcome::new(MutationKind::Move, key);
        outcome.placement_id = Some(request.placement_id);

        let Some(mut hierarchy) = self.store.load_hierarchy(key)? else {
            return Ok(outcome.no_op(&missing_hierarchy(key)));
        };
        let parent_category = match category_parent(&hierarchy, request.new_parent) {
            Ok(parent) => parent,
            Err(err) if err.is_benign() => return Ok(outcome.no_op(&err)),
            Err(err) => return Err(err),
        };

        self.enter(key, MutationPhase::Mutating);
        let captured =
            match hierarchy.move_by_placement_id(request.placement_id, request.new_parent) {
                Ok(captured) => captured,
                Err(err) if err.is_benign() => return Ok(outcome.no_op(&err)),
                Err(err) => return Err(err),
            };
        self.store.save_hierarchy(&mut hierarchy)?;
        outcome.content_id = Some(captured.content_id.clone());

        let nodes = distinct_content_ids(captured.subtree());
        match self.reparent(key, &captured, parent_category) {
            Ok(()) => self.cascade(key, &nodes, true, &mut outcome),
            // Every captured node still caches the old chain; all of them need the refresh.
            Err(err) => {
                for content_id in &nodes {
                    outcome.fail(content_id, MutationPhase::Mutating, err.clone());
                }
            }
        }
        Ok(self.conclude(outcome))
    }

    fn remove_node_inner(
        &mut self,
        key: &HierarchyKey,
        request: RemoveNode,
    ) -> Result<MutationOutcome, TreeError> {
        key.validate()?;
        let mut outcome = MutationOutcome::new(MutationKind::Remove, key);
        let hierarchy = self.store.load_hierarchy(key)?;

        let placement_id = match &request.target {
            RemoveTarget::Placement(placement_id) => Some(*placement_id),
            RemoveTarget::Content(content_id) => {
                content_id.validate()?;
                outcome.content_id = Some(content_id.clone());
                hierarchy
                    .as_ref()
                    .and_then(|hierarchy| hierarchy.find_by_content_id(content_id))
                    .map(|placement| placement.placement_id)
            }
        };

        let nodes = match (placement_id, hierarchy) {
            (Some(placement_id), Some(mut hierarchy)) => {
                outcome.placement_id = Some(placement_id);
                self.enter(key, MutationPhase::Mutating);
                let removed = match hierarchy.remove_by_placement_id(placement_id) {
                    Ok(removed) => removed,
                    Err(err) if err.is_benign() => return Ok(outcome.no_op(&err)),
                    Err(err) => return Err(err),
                };
                self.store.save_hierarchy(&mut hierarchy)?;
                distinct_content_ids(removed.subtree())
            }
            (Some(placement_id), None) => {
                outcome.placement_id = Some(placement_id);
                return Ok(outcome.no_op(&missing_hierarchy(key)));
            }
            (None, _) => {
                let RemoveTarget::Content(content_id) = &request.target else {
                    return Ok(outcome.no_op(&missing_hierarchy(key)));
                };
                let live = self.store.get_content(key, content_id)?.is_some_and(|r| !r.removed);
                if !live {
                    return Ok(outcome.no_op(&missing_content(key, content_id)));
                }
                self.enter(key, MutationPhase::Mutating);
                self.content_subtree(key, content_id)?
            }
        };

        outcome.content_id = nodes.first().cloned();
        self.retire(key, &nodes, request.purge, &mut outcome);
        Ok(self.conclude(outcome))
    }

    fn update_config_inner(
        &mut self,
        key: &HierarchyKey,
        request: UpdateConfig,
    ) -> Result<MutationOutcome, TreeError> {
        key.validate()?;
        request.content_id.validate()?;
        let mut outcome = MutationOutcome::new(MutationKind::UpdateConfig, key);
        outcome.content_id = Some(request.content_id.clone());

        let Some(mut record) =
            self.store.get_content(key, &request.content_id)?.filter(|record| !record.removed)
        else {
            return Ok(outcome.no_op(&missing_content(key, &request.content_id)));
        };
        record.local_config = request.local_config;
        record.category_config = request.category_config;
        record.touch();
        record.validate()?;

        self.enter(key, MutationPhase::Mutating);
        self.store.put_content(&record)?;

        let descendants = self.descendants_of(key, &request.content_id)?;
        self.cascade(key, &descendants, false, &mut outcome);
        Ok(self.conclude(outcome))
    }

    fn refresh_inner(
        &mut self,
        key: &HierarchyKey,
        content_ids: &[ContentId],
    ) -> Result<MutationOutcome, TreeError> {
        key.validate()?;
        let mut outcome = MutationOutcome::new(MutationKind::Refresh, key);
        let hierarchy = self.store.load_hierarchy(key)?;
        let requested = refresh_order(hierarchy.as_ref(), content_ids);
        outcome.content_id = requested.first().cloned();

        self.enter(key, MutationPhase::Mutating);
        let mut targets = content_ids.to_vec();
        if let Some(hierarchy) = &hierarchy {
            for content_id in &requested {
                match self.sync_parent(hierarchy, content_id) {
                    Ok(true) => {
                        if let Some(placement) = hierarchy.find_by_content_id(content_id) {
                            let below = distinct_content_ids(placement.subtree());
                            targets.extend(below.into_iter().skip(1));
                        }
                    }
                    Ok(false) => {}
                    Err(err) => outcome.fail(content_id, MutationPhase::Mutating, err),
                }
            }
        }
        let ordered = refresh_order(hierarchy.as_ref(), &targets);
        self.cascade(key, &ordered, true, &mut outcome);
        Ok(self.conclude(outcome))
    }

    fn add_originating_satellite_inner(
        &mut self,
        record: SatelliteRecord,
    ) -> Result<MutationOutcome, TreeError> {
        record.validate()?;
        if !record.is_originating() {
            return Err(TreeError::Validation(
                "only originating satellite records can be authored".to_string(),
            ));
        }
        if !self.config.satellite_kinds.contains(&record.kind) {
            return Err(TreeError::Validation(format!(
                "satellite kind {} is not enabled",
                record.kind.as_str()
            )));
        }
        let key = record.key.clone();
        let owner = record.owner_content_id.clone();
        let mut outcome = MutationOutcome::new(MutationKind::AddSatellite, &key);
        outcome.content_id = Some(owner.clone());

        let live = self.store.get_content(&key, &owner)?.is_some_and(|r| !r.removed);
        if !live {
            return Ok(outcome.no_op(&missing_content(&key, &owner)));
        }

        self.enter(&key, MutationPhase::Mutating);
        self.store.insert_originating(&record)?;
        outcome.satellites.created += 1;

        let descendants = self.descendants_of(&key, &owner)?;
        self.enter(&key, MutationPhase::PropagatingSatellites);
        for content_id in &descendants {
            let chain = match self.store.get_content(&key, content_id) {
                Ok(Some(descendant)) if !descendant.removed => descendant.ancestor_chain,
                Ok(_) => continue,
                Err(err) => {
                    outcome.fail(content_id, MutationPhase::PropagatingSatellites, err);
                    continue;
                }
            };
            match propagate_satellites(&mut *self.store, &key, &[record.kind], content_id, &chain)
            {
                Ok(report) => {
                    outcome.satellites.absorb(report);
                    outcome.affected.push(content_id.clone());
                }
                Err(err) => outcome.fail(content_id, MutationPhase::PropagatingSatellites, err),
            }
        }
        Ok(self.conclude(outcome))
    }

    fn remove_originating_satellite_inner(
        &mut self,
        key: &HierarchyKey,
        kind: SatelliteKind,
        owner: &ContentId,
        record_key: &str,
    ) -> Result<MutationOutcome, TreeError> {
        key.validate()?;
        owner.validate()?;
        let mut outcome = MutationOutcome::new(MutationKind::RemoveSatellite, key);
        outcome.content_id = Some(owner.clone());

        self.enter(key, MutationPhase::Mutating);
        if !self.store.delete_record(key, kind, owner, record_key, None)? {
            return Ok(outcome.no_op(&TreeError::NotFound(format!(
                "{} `{record_key}` on {owner} in hierarchy {key}",
                kind.as_str()
            ))));
        }
        outcome.satellites.deleted += 1;

        self.enter(key, MutationPhase::PropagatingSatellites);
        let copies = self.store.find_by_source_ancestor(key, kind, owner)?;
        for copy in copies.iter().filter(|copy| copy.record_key == record_key) {
            match self.store.delete_record(
                key,
                kind,
                &copy.owner_content_id,
                record_key,
                Some(owner),
            ) {
                Ok(deleted) => {
                    outcome.satellites.deleted += usize::from(deleted);
                    outcome.affected.push(copy.owner_content_id.clone());
                }
                Err(err) => {
                    outcome.fail(&copy.owner_content_id, MutationPhase::PropagatingSatellites, err);
                }
            }
        }
        Ok(self.conclude(outcome))
    }

    /// Resolve every node, then propagate every resolved node, both in `nodes` order.
    fn cascade(
        &mut self,
        key: &HierarchyKey,
        nodes: &[ContentId],
        first_is_target: bool,
        outcome: &mut MutationOutcome,
    ) {
        let mut resolved = Vec::with_capacity(nodes.len());
        for (index, content_id) in nodes.iter().enumerate() {
            let phase = if first_is_target && index == 0 {
                MutationPhase::ResolvingSelf
            } else {
                MutationPhase::ResolvingDescendants
            };
            self.enter(key, phase);
            match self.resolve_node(key, content_id) {
                Ok(Some((chain, anomalies))) => {
                    outcome.anomalies.extend(anomalies);
                    outcome.affected.push(content_id.clone());
                    resolved.push((content_id, chain));
                }
                Ok(None) => {}
                Err(err) => outcome.fail(content_id, phase, err),
            }
        }

        self.enter(key, MutationPhase::PropagatingSatellites);
        for (content_id, chain) in resolved {
            match propagate_satellites(
                &mut *self.store,
                key,
                &self.config.satellite_kinds,
                content_id,
                &chain,
            ) {
                Ok(report) => outcome.satellites.absorb(report),
                Err(err) => outcome.fail(content_id, MutationPhase::PropagatingSatellites, err),
            }
        }
    }

    /// Rebuild both caches of one live record. `None` when the record is missing or removed.
    fn resolve_node(
        &mut self,
        key: &HierarchyKey,
        content_id: &ContentId,
    ) -> Result<Option<(Vec<ContentId>, Vec<ResolutionAnomaly>)>, TreeError> {
        let Some(mut record) = self.store.get_content(key, content_id)? else {
            return Ok(None);
        };
        if record.removed {
            return Ok(None);
        }

        let resolution =
            resolve_ancestor_chain(&*self.store, key, content_id, self.config.max_depth)?;
        let (snapshot, snapshot_anomalies) =
            resolve_inherited_config_snapshot(&*self.store, key, content_id, &resolution.chain)?;

        record.ancestor_chain.clone_from(&resolution.chain);
        record.inherited_config = snapshot;
        record.touch();
        self.store.put_content(&record)?;

        let mut anomalies = resolution.anomalies;
        anomalies.extend(snapshot_anomalies);
        Ok(Some((resolution.chain, anomalies)))
    }

    /// Exit pass, then soft-delete or purge. Runs in `nodes` order.
    fn retire(
        &mut self,
        key: &HierarchyKey,
        nodes: &[ContentId],
        purge: bool,
        outcome: &mut MutationOutcome,
    ) {
        let mut cleared = Vec::with_capacity(nodes.len());
        for (index, content_id) in nodes.iter().enumerate() {
            let phase = if index == 0 {
                MutationPhase::ResolvingSelf
            } else {
                MutationPhase::ResolvingDescendants
            };
            self.enter(key, phase);
            match self.clear_caches(key, content_id) {
                Ok(true) => cleared.push(content_id),
                Ok(false) => {}
                Err(err) => outcome.fail(content_id, phase, err),
            }
        }

        self.enter(key, MutationPhase::PropagatingSatellites);
        let mut retired = Vec::with_capacity(cleared.len());
        for content_id in cleared {
            match propagate_satellites(
                &mut *self.store,
                key,
                &self.config.satellite_kinds,
                content_id,
                &[],
            ) {
                Ok(report) => {
                    outcome.satellites.absorb(report);
                    retired.push(content_id);
                }
                Err(err) => outcome.fail(content_id, MutationPhase::PropagatingSatellites, err),
            }
        }

        self.enter(key, MutationPhase::Mutating);
        for content_id in retired {
            let result = if purge {
                self.purge(key, content_id, outcome)
            } else {
                self.mark_removed(key, content_id)
            };
            match result {
                Ok(()) => outcome.affected.push(content_id.clone()),
                Err(err) => outcome.fail(content_id, MutationPhase::Mutating, err),
            }
        }
    }

    fn clear_caches(
        &mut self,
        key: &HierarchyKey,
        content_id: &ContentId,
    ) -> Result<bool, TreeError> {
        let Some(mut record) = self.store.get_content(key, content_id)? else {
            return Ok(false);
        };
        record.clear_inheritance();
        self.store.put_content(&record)?;
        Ok(true)
    }

    fn purge(
        &mut self,
        key: &HierarchyKey,
        content_id: &ContentId,
        outcome: &mut MutationOutcome,
    ) -> Result<(), TreeError> {
        outcome.satellites.deleted += self.store.delete_owned(key, content_id)?;
        self.store.purge_content(key, content_id)?;
        Ok(())
    }

    fn mark_removed(
        &mut self,
        key: &HierarchyKey,
        content_id: &ContentId,
    ) -> Result<(), TreeError> {
        if let Some(mut record) = self.store.get_content(key, content_id)? {
            record.removed = true;
            record.touch();
            self.store.put_content(&record)?;
        }
        Ok(())
    }

    fn reparent(
        &mut self,
        key: &HierarchyKey,
        moved: &Placement,
        parent_category: Option<ContentId>,
    ) -> Result<(), TreeError> {
        let mut record = self.store.get_content(key, &moved.content_id)?.unwrap_or_else(|| {
            ContentRecord::new(key.clone(), moved.content_id.clone(), moved.is_category)
        });
        record.parent_category_id = parent_category;
        record.touch();
        record.validate()?;
        self.store.put_content(&record)
    }

    /// Align a placed record's parent pointer with its placement's parent, creating the record
    /// when the placement has none. `true` when the record was written.
    fn sync_parent(
        &mut self,
        hierarchy: &Hierarchy,
        content_id: &ContentId,
    ) -> Result<bool, TreeError> {
        let Some(placement) = hierarchy.find_by_content_id(content_id) else {
            return Ok(false);
        };
        if placement.placement_id == hierarchy.root.placement_id {
            return Ok(false);
        }
        let parent = hierarchy
            .parent_of(placement.placement_id)
            .filter(|parent| parent.placement_id != hierarchy.root.placement_id)
            .map(|parent| parent.content_id.clone());

        let mut record = match self.store.get_content(&hierarchy.key, content_id)? {
            Some(record) if record.removed || record.parent_category_id == parent => {
                return Ok(false);
            }
            Some(record) => {
                tracing::info!(
                    owner_id = %hierarchy.key.owner_id,
                    branch = %hierarchy.key.branch,
                    content_id = %content_id,
                    "parent pointer realigned with placement"
                );
                record
            }
            None => {
                tracing::info!(
                    owner_id = %hierarchy.key.owner_id,
                    branch = %hierarchy.key.branch,
                    content_id = %content_id,
                    placement_id = %placement.placement_id,
                    "content record rebuilt from placement"
                );
                ContentRecord::new(hierarchy.key.clone(), content_id.clone(), placement.is_category)
            }
        };
        record.parent_category_id = parent;
        record.touch();
        record.validate()?;
        self.store.put_content(&record)?;
        Ok(true)
    }

    /// Descendants of `content_id` in pre-order, excluding itself. Uses the placement subtree
    /// when the content is placed and parent pointers otherwise.
    fn descendants_of(
        &self,
        key: &HierarchyKey,
        content_id: &ContentId,
    ) -> Result<Vec<ContentId>, TreeError> {
        if let Some(hierarchy) = self.store.load_hierarchy(key)? {
            if let Some(placement) = hierarchy.find_by_content_id(content_id) {
                return Ok(distinct_content_ids(placement.subtree())
                    .into_iter()
                    .filter(|id| id != content_id)
                    .collect());
            }
        }
        Ok(self.content_subtree(key, content_id)?.into_iter().skip(1).collect())
    }

    /// `root` followed by its live parent-pointer descendants, pre-order.
    fn content_subtree(
        &self,
        key: &HierarchyKey,
        root: &ContentId,
    ) -> Result<Vec<ContentId>, TreeError> {
        let mut out = Vec::new();
        let mut seen = BTreeSet::new();
        let mut stack = vec![root.clone()];
        while let Some(content_id) = stack.pop() {
            if !seen.insert(content_id.clone()) {
                continue;
            }
            let children = self.store.list_children(key, &content_id)?;
            out.push(content_id);
            stack.extend(children.into_iter().rev());
        }
        Ok(out)
    }

    fn enter(&mut self, key: &HierarchyKey, phase: MutationPhase) {
        if self.phase == phase {
            return;
        }
        tracing::debug!(
            owner_id = %key.owner_id,
            branch = %key.branch,
            from = self.phase.as_str(),
            to = phase.as_str(),
            "mutation phase"
        );
        self.phase = phase;
    }

    fn finish<T>(
        &mut self,
        key: &HierarchyKey,
        result: Result<T, TreeError>,
    ) -> Result<T, TreeError> {
        self.enter(key, MutationPhase::Idle);
        result
    }

    fn conclude(&self, mut outcome: MutationOutcome) -> MutationOutcome {
        if !outcome.failed.is_empty() {
            outcome.status = MutationStatus::PartiallyApplied;
        }
        tracing::info!(
            owner_id = %outcome.key.owner_id,
            branch = %outcome.key.branch,
            operator = %self.operator,
            mutation = outcome.mutation.as_str(),
            affected = outcome.affected.len(),
            failed = outcome.failed.len(),
            satellites_created = outcome.satellites.created,
            satellites_deleted = outcome.satellites.deleted,
            "mutation finished"
        );
        self.record_audit(&outcome);
        outcome
    }

    fn record_audit(&self, outcome: &MutationOutcome) {
        if outcome.mutation == MutationKind::Refresh || outcome.status == MutationStatus::NoOp {
            return;
        }
        let Some(content_id) = outcome.content_id.clone() else {
            return;
        };
        let entry = AuditEntry {
            recorded_at: OffsetDateTime::now_utc(),
            operator: self.operator.clone(),
            mutation: outcome.mutation,
            key: outcome.key.clone(),
            content_id,
        };
        if let Err(err) = self.audit.record(&entry) {
            tracing::warn!(
                owner_id = %entry.key.owner_id,
                branch = %entry.key.branch,
                content_id = %entry.content_id,
                error = %err,
                "audit sink rejected entry; mutation kept"
            );
        }
    }
}

fn missing_hierarchy(key: &HierarchyKey) -> TreeError {
    TreeError::NotFound(format!("hierarchy {key}"))
}

fn missing_content(key: &HierarchyKey, content_id: &ContentId) -> TreeError {
    TreeError::NotFound(format!("content {content_id} in hierarchy {key}"))
}

/// Parent category a node placed under `parent` points at. The root placement yields `None`.
fn category_parent(
    hierarchy: &Hierarchy,
    parent: PlacementId,
) -> Result<Option<ContentId>, TreeError> {
    let placement = hierarchy.find_by_placement_id(parent).ok_or_else(|| {
        TreeError::NotFound(format!("placement {parent} in hierarchy {}", hierarchy.key))
    })?;
    if placement.placement_id == hierarchy.root.placement_id {
        return Ok(None);
    }
    if !placement.is_category {
        return Err(TreeError::Validation(format!(
            "placement {parent} holds entity {} and cannot have children",
            placement.content_id
        )));
    }
    Ok(Some(placement.content_id.clone()))
}

fn distinct_content_ids(placements: Vec<&Placement>) -> Vec<ContentId> {
    let mut seen = BTreeSet::new();
    placements
        .into_iter()
        .filter(|placement| seen.insert(placement.content_id.clone()))
        .map(|placement| placement.content_id.clone())
        .collect()
}

/// Placed ids in tree pre-order, then unplaced ids in request order.
fn refresh_order(hierarchy: Option<&Hierarchy>, content_ids: &[ContentId]) -> Vec<ContentId> {
    let requested: BTreeSet<&ContentId> = content_ids.iter().collect();
    let mut seen = BTreeSet::new();
    let mut ordered = Vec::with_capacity(content_ids.len());
    if let Some(hierarchy) = hierarchy {
        for placement in hierarchy.root.subtree() {
            if requested.contains(&placement.content_id) && seen.insert(&placement.content_id) {
                ordered.push(placement.content_id.clone());
            }
        }
    }
    for content_id in content_ids {
        if seen.insert(content_id) {
            ordered.push(content_id.clone());
        }
    }
    ordered
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use serde_json::json;

    use super::*;
    use crate::{
        ancestor_chain, inherited_config, verify_hierarchy, InheritedConfig, MemoryStore,
        TracingAuditSink,
    };

    fn key() -> HierarchyKey {
        HierarchyKey::new("acme", "main")
    }

    fn ids(values: &[&str]) -> Vec<ContentId> {
        values.iter().map(|value| ContentId::from(*value)).collect()
    }

    #[derive(Default)]
    struct RecordingSink {
        entries: RefCell<Vec<AuditEntry>>,
    }

    impl AuditSink for RecordingSink {
        fn record(&self, entry: &AuditEntry) -> Result<(), String> {
            self.entries.borrow_mut().push(entry.clone());
            Ok(())
        }
    }

    struct BrokenSink;

    impl AuditSink for BrokenSink {
        fn record(&self, _entry: &AuditEntry) -> Result<(), String> {
            Err("audit backend offline".to_string())
        }
    }

    struct Fixture {
        store: MemoryStore,
        root: PlacementId,
    }

    impl Fixture {
        fn new() -> Self {
            let mut store = MemoryStore::default();
            let sink = TracingAuditSink;
            let root = {
                let mut coordinator = coordinator_for(&mut store, &sink);
                match coordinator.init_hierarchy(&key(), "root".into()) {
                    Ok(hierarchy) => hierarchy.root.placement_id,
                    Err(err) => panic!("init failed: {err}"),
                }
            };
            Self { store, root }
        }

        fn create(
            &mut self,
            parent: PlacementId,
            id: &str,
            is_category: bool,
            config: Value,
        ) -> PlacementId {
            let sink = TracingAuditSink;
            let mut coordinator = coordinator_for(&mut self.store, &sink);
            let request = CreateNode {
                parent,
                content_id: id.into(),
                is_category,
                local_config: Some(config),
                category_config: None,
            };
            match coordinator.create_node(&key(), request) {
                Ok(outcome) if outcome.status == MutationStatus::Applied => {
                    match outcome.placement_id {
                        Some(placement_id) => placement_id,
                        None => panic!("create of {id} returned no placement"),
                    }
                }
                Ok(outcome) => panic!("create of {id} was not applied: {outcome:?}"),
                Err(err) => panic!("create of {id} failed: {err}"),
            }
        }

        fn move_node(
            &mut self,
            placement_id: PlacementId,
            new_parent: PlacementId,
        ) -> MutationOutcome {
            let sink = TracingAuditSink;
            let mut coordinator = coordinator_for(&mut self.store, &sink);
            match coordinator.move_node(&key(), MoveNode { placement_id, new_parent }) {
                Ok(outcome) => outcome,
                Err(err) => panic!("move failed: {err}"),
            }
        }

        fn chain(&self, id: &str) -> Vec<ContentId> {
            match ancestor_chain(&self.store, &key(), &id.into()) {
                Ok(chain) => chain,
                Err(err) => panic!("chain of {id}: {err}"),
            }
        }

        fn record(&self, id: &str) -> ContentRecord {
            match self.store.get_content(&key(), &id.into()) {
                Ok(Some(record)) => record,
                other => panic!("record {id} missing: {other:?}"),
            }
        }

        fn localize(&mut self, owner: &str, record_key: &str) {
            let sink = TracingAuditSink;
            let mut coordinator = coordinator_for(&mut self.store, &sink);
            let record = SatelliteRecord::originating(
                key(),
                SatelliteKind::Localization,
                owner.into(),
                record_key,
                json!("Hello"),
            );
            if let Err(err) = coordinator.add_originating_satellite(record) {
                panic!("add satellite failed: {err}");
            }
        }

        fn consistent(&self) -> bool {
            match verify_hierarchy(&self.store, &key(), &EngineConfig::default()) {
                Ok(report) => report.is_consistent(),
                Err(err) => panic!("verify failed: {err}"),
            }
        }

        fn copies_on(&self, owner: &str) -> Vec<(String, String)> {
            self.store
                .satellites()
                .into_iter()
                .filter(|record| record.owner_content_id.as_str() == owner)
                .filter_map(|record| {
                    let source = record.source_ancestor_id.as_ref()?;
                    Some((source.to_string(), record.record_key.clone()))
                })
                .collect()
        }
    }

    fn coordinator_for<'a>(
        store: &'a mut MemoryStore,
        sink: &'a dyn AuditSink,
    ) -> MutationCoordinator<'a, MemoryStore> {
        match MutationCoordinator::new(store, EngineConfig::default(), sink, "tester") {
            Ok(coordinator) => coordinator,
            Err(err) => panic!("coordinator should build: {err}"),
        }
    }

    /// root -> A{x:1} -> B{y:2} -> E
    fn abe() -> (Fixture, PlacementId, PlacementId, PlacementId) {
        let mut fixture = Fixture::new();
        let root = fixture.root;
        let a = fixture.create(root, "A", true, json!({"x": 1}));
        let b = fixture.create(a, "B", true, json!({"y": 2}));
        let e = fixture.create(b, "E", false, json!({}));
        (fixture, a, b, e)
    }

    #[test]
    fn create_resolves_chain_and_snapshot() -> Result<(), TreeError> {
        let (fixture, ..) = abe();
        assert_eq!(fixture.chain("E"), ids(&["A", "B"]));
        assert_eq!(
            inherited_config(&fixture.store, &key(), &"E".into())?,
            vec![
                InheritedConfig { source_id: "A".into(), config: json!({"x": 1}) },
                InheritedConfig { source_id: "B".into(), config: json!({"y": 2}) },
            ]
        );
        assert!(fixture.chain("A").is_empty());
        Ok(())
    }

    #[test]
    fn moving_to_root_prunes_departed_ancestor() -> Result<(), TreeError> {
        let (mut fixture, _, b, _) = abe();
        let root = fixture.root;
        let outcome = fixture.move_node(b, root);

        assert_eq!(outcome.status, MutationStatus::Applied);
        assert_eq!(outcome.affected, ids(&["B", "E"]));
        assert_eq!(fixture.chain("E"), ids(&["B"]));
        assert!(fixture.chain("B").is_empty());
        assert_eq!(
            inherited_config(&fixture.store, &key(), &"E".into())?,
            vec![InheritedConfig { source_id: "B".into(), config: json!({"y": 2}) }]
        );
        assert!(fixture.record("B").parent_category_id.is_none());
        Ok(())
    }

    #[test]
    fn localization_joins_and_exits_with_the_chain() {
        let (mut fixture, a, b, _) = abe();
        let root = fixture.root;
        fixture.localize("A", "K");
        assert_eq!(fixture.copies_on("E"), vec![("A".to_string(), "K".to_string())]);
        assert_eq!(fixture.copies_on("B"), vec![("A".to_string(), "K".to_string())]);

        let outcome = fixture.move_node(b, root);
        assert_eq!(outcome.satellites.deleted, 2);
        assert!(fixture.copies_on("E").is_empty());
        assert!(fixture.copies_on("B").is_empty());

        let outcome = fixture.move_node(b, a);
        assert_eq!(outcome.satellites.created, 2);
        assert_eq!(fixture.copies_on("E"), vec![("A".to_string(), "K".to_string())]);
    }

    #[test]
    fn leaf_move_touches_only_the_leaf() {
        let (mut fixture, a, _, e) = abe();
        let outcome = fixture.move_node(e, a);
        assert_eq!(outcome.affected, ids(&["E"]));
        assert_eq!(fixture.chain("E"), ids(&["A"]));
    }

    #[test]
    fn category_move_rebuilds_every_descendant() {
        let mut fixture = Fixture::new();
        let root = fixture.root;
        let a = fixture.create(root, "A", true, json!({}));
        let z = fixture.create(root, "Z", true, json!({}));
        let b = fixture.create(a, "B", true, json!({}));
        for index in 0..4 {
            fixture.create(b, &format!("e{index}"), false, json!({}));
        }

        let outcome = fixture.move_node(b, z);
        assert_eq!(outcome.affected.len(), 5);
        assert_eq!(outcome.affected[0], ContentId::from("B"));
        for index in 0..4 {
            assert_eq!(fixture.chain(&format!("e{index}")), ids(&["Z", "B"]));
        }
    }

    #[test]
    fn moving_beneath_itself_is_rejected_before_any_write() {
        let (mut fixture, a, b, _) = abe();
        let before = fixture.store.load_hierarchy(&key());
        let sink = TracingAuditSink;
        let mut coordinator = coordinator_for(&mut fixture.store, &sink);
        let err = coordinator.move_node(&key(), MoveNode { placement_id: a, new_parent: b });
        assert!(matches!(err, Err(TreeError::Validation(_))));
        assert_eq!(coordinator.phase(), MutationPhase::Idle);
        drop(coordinator);
        assert_eq!(fixture.store.load_hierarchy(&key()), before);
    }

    #[test]
    fn missing_placement_is_a_no_op() {
        let (mut fixture, ..) = abe();
        let root = fixture.root;
        let outcome = fixture.move_node(PlacementId::new(), root);
        assert_eq!(outcome.status, MutationStatus::NoOp);
        assert!(outcome.reason.is_some());
        assert!(outcome.affected.is_empty());
    }

    #[test]
    fn create_rejects_entity_parent_and_duplicate_content() {
        let (mut fixture, a, _, e) = abe();
        let sink = TracingAuditSink;
        let mut coordinator = coordinator_for(&mut fixture.store, &sink);
        let under_entity = CreateNode {
            parent: e,
            content_id: "X".into(),
            is_category: false,
            local_config: None,
            category_config: None,
        };
        assert!(matches!(
            coordinator.create_node(&key(), under_entity),
            Err(TreeError::Validation(_))
        ));

        let duplicate = CreateNode {
            parent: a,
            content_id: "E".into(),
            is_category: false,
            local_config: None,
            category_config: None,
        };
        assert!(matches!(
            coordinator.create_node(&key(), duplicate),
            Err(TreeError::Validation(_))
        ));
    }

    #[test]
    fn remove_clears_subtree_and_keeps_originating_records() -> Result<(), TreeError> {
        let (mut fixture, _, b, _) = abe();
        fixture.localize("A", "K");
        fixture.localize("B", "L");

        let sink = TracingAuditSink;
        let mut coordinator = coordinator_for(&mut fixture.store, &sink);
        let outcome = coordinator.remove_node(
            &key(),
            RemoveNode { target: RemoveTarget::Placement(b), purge: false },
        )?;
        drop(coordinator);

        assert_eq!(outcome.status, MutationStatus::Applied);
        assert_eq!(outcome.affected, ids(&["B", "E"]));
        for id in ["B", "E"] {
            let record = fixture.record(id);
            assert!(record.removed);
            assert!(record.ancestor_chain.is_empty());
            assert!(record.inherited_config.is_empty());
            assert!(fixture.copies_on(id).is_empty());
        }
        let originating: Vec<_> = fixture
            .store
            .satellites()
            .into_iter()
            .filter(|record| record.is_originating())
            .map(|record| record.owner_content_id.to_string())
            .collect();
        assert_eq!(originating, vec!["A", "B"]);
        assert!(matches!(
            ancestor_chain(&fixture.store, &key(), &"E".into()),
            Err(TreeError::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn purge_deletes_records_and_owned_satellites() -> Result<(), TreeError> {
        let (mut fixture, ..) = abe();
        fixture.localize("B", "L");

        let sink = TracingAuditSink;
        let mut coordinator = coordinator_for(&mut fixture.store, &sink);
        let outcome = coordinator.remove_node(
            &key(),
            RemoveNode { target: RemoveTarget::Content("B".into()), purge: true },
        )?;
        drop(coordinator);

        assert_eq!(outcome.affected, ids(&["B", "E"]));
        assert!(fixture.store.get_content(&key(), &"B".into())?.is_none());
        assert!(fixture.store.get_content(&key(), &"E".into())?.is_none());
        assert!(fixture.store.satellites().is_empty());
        Ok(())
    }

    #[test]
    fn cycle_in_one_descendant_does_not_stop_siblings() -> Result<(), TreeError> {
        let mut fixture = Fixture::new();
        let root = fixture.root;
        let a = fixture.create(root, "A", true, json!({}));
        let z = fixture.create(root, "Z", true, json!({}));
        fixture.create(a, "B", true, json!({}));
        fixture.create(a, "C", true, json!({}));
        fixture.create(a, "D", false, json!({}));

        for (id, parent) in [("B", "C"), ("C", "B")] {
            let mut record = fixture.record(id);
            record.parent_category_id = Some(parent.into());
            fixture.store.put_content(&record)?;
        }

        let outcome = fixture.move_node(a, z);
        assert_eq!(outcome.status, MutationStatus::PartiallyApplied);
        assert_eq!(outcome.failed_content_ids(), ids(&["B", "C"]));
        assert!(outcome
            .failed
            .iter()
            .all(|failure| matches!(failure.error, TreeError::CycleDetected { .. })));
        assert_eq!(fixture.chain("D"), ids(&["Z", "A"]));
        Ok(())
    }

    #[test]
    fn failed_write_is_reported_and_refresh_repairs_it() -> Result<(), TreeError> {
        let mut fixture = Fixture::new();
        let root = fixture.root;
        let a = fixture.create(root, "A", true, json!({}));
        let z = fixture.create(root, "Z", true, json!({}));
        let b = fixture.create(a, "B", true, json!({}));
        fixture.create(b, "E", false, json!({}));
        fixture.store.fail_content_writes_for(&"B".into());

        let outcome = fixture.move_node(b, z);
        assert_eq!(outcome.status, MutationStatus::PartiallyApplied);
        assert_eq!(outcome.failed_content_ids(), ids(&["B", "E"]));
        assert!(outcome.failed.iter().all(|failure| failure.phase == MutationPhase::Mutating));
        assert!(!outcome.is_success());

        fixture.store.clear_injected_failures();

        let sink = TracingAuditSink;
        let mut coordinator = coordinator_for(&mut fixture.store, &sink);
        let refreshed = coordinator.refresh(&key(), &outcome.failed_content_ids())?;
        drop(coordinator);
        assert_eq!(refreshed.status, MutationStatus::Applied);
        assert_eq!(refreshed.affected, ids(&["B", "E"]));
        assert_eq!(fixture.chain("B"), ids(&["Z"]));
        assert_eq!(fixture.chain("E"), ids(&["Z", "B"]));
        assert!(fixture.consistent());
        Ok(())
    }

    #[test]
    fn refreshing_a_realigned_parent_rebuilds_its_subtree() -> Result<(), TreeError> {
        let mut fixture = Fixture::new();
        let root = fixture.root;
        let a = fixture.create(root, "A", true, json!({"x": 1}));
        let z = fixture.create(root, "Z", true, json!({"z": 1}));
        let b = fixture.create(a, "B", true, json!({}));
        fixture.create(b, "E", false, json!({}));
        fixture.store.fail_content_writes_for(&"B".into());
        fixture.move_node(b, z);
        fixture.store.clear_injected_failures();

        let sink = TracingAuditSink;
        let mut coordinator = coordinator_for(&mut fixture.store, &sink);
        let refreshed = coordinator.refresh(&key(), &ids(&["B"]))?;
        drop(coordinator);

        assert_eq!(refreshed.affected, ids(&["B", "E"]));
        assert_eq!(fixture.record("B").parent_category_id, Some("Z".into()));
        assert_eq!(fixture.chain("E"), ids(&["Z", "B"]));
        assert_eq!(
            inherited_config(&fixture.store, &key(), &"E".into())?[0],
            InheritedConfig { source_id: "Z".into(), config: json!({"z": 1}) }
        );
        assert!(fixture.consistent());
        Ok(())
    }

    #[test]
    fn refresh_rebuilds_a_record_lost_during_create() -> Result<(), TreeError> {
        let (mut fixture, a, ..) = abe();
        fixture.store.fail_content_writes_for(&"X".into());

        let sink = TracingAuditSink;
        let mut coordinator = coordinator_for(&mut fixture.store, &sink);
        let request = CreateNode {
            parent: a,
            content_id: "X".into(),
            is_category: false,
            local_config: None,
            category_config: None,
        };
        let created = coordinator.create_node(&key(), request)?;
        drop(coordinator);
        assert_eq!(created.status, MutationStatus::PartiallyApplied);
        assert_eq!(created.failed_content_ids(), ids(&["X"]));
        assert!(fixture.store.get_content(&key(), &"X".into())?.is_none());

        fixture.store.clear_injected_failures();
        let mut coordinator = coordinator_for(&mut fixture.store, &sink);
        let refreshed = coordinator.refresh(&key(), &created.failed_content_ids())?;
        drop(coordinator);

        assert_eq!(refreshed.status, MutationStatus::Applied);
        assert_eq!(refreshed.affected, ids(&["X"]));
        assert_eq!(fixture.record("X").parent_category_id, Some("A".into()));
        assert_eq!(fixture.chain("X"), ids(&["A"]));
        assert!(fixture.consistent());
        Ok(())
    }

    #[test]
    fn refresh_reports_a_soft_removed_parent() -> Result<(), TreeError> {
        let (mut fixture, ..) = abe();
        let mut parent = fixture.record("A");
        parent.removed = true;
        fixture.store.put_content(&parent)?;

        let sink = TracingAuditSink;
        let mut coordinator = coordinator_for(&mut fixture.store, &sink);
        let outcome = coordinator.refresh(&key(), &ids(&["B"]))?;
        drop(coordinator);

        assert_eq!(outcome.affected, ids(&["B"]));
        assert_eq!(
            outcome.anomalies,
            vec![ResolutionAnomaly::DanglingParent { content_id: "B".into(), missing: "A".into() }]
        );
        assert!(fixture.chain("B").is_empty());
        Ok(())
    }

    #[test]
    fn create_below_max_depth_is_rejected_up_front() -> Result<(), TreeError> {
        let mut fixture = Fixture::new();
        let root = fixture.root;
        let a = fixture.create(root, "A", true, json!({}));
        let b = fixture.create(a, "B", true, json!({}));
        let c = fixture.create(b, "C", true, json!({}));
        let before = fixture.store.load_hierarchy(&key())?.map(|h| h.placement_count());

        let sink = TracingAuditSink;
        let config = EngineConfig { max_depth: 2, ..EngineConfig::default() };
        let mut coordinator =
            MutationCoordinator::new(&mut fixture.store, config, &sink, "tester")?;
        let too_deep = CreateNode {
            parent: c,
            content_id: "X".into(),
            is_category: false,
            local_config: None,
            category_config: None,
        };
        assert!(matches!(coordinator.create_node(&key(), too_deep), Err(TreeError::Validation(_))));
        drop(coordinator);

        assert_eq!(fixture.store.load_hierarchy(&key())?.map(|h| h.placement_count()), before);
        assert!(fixture.store.get_content(&key(), &"X".into())?.is_none());
        assert_eq!(fixture.chain("C"), ids(&["A", "B"]));
        Ok(())
    }

    #[test]
    fn removing_unplaced_content_retires_pointer_children() -> Result<(), TreeError> {
        let mut fixture = Fixture::new();
        fixture.store.put_content(&ContentRecord::new(key(), "U".into(), true))?;
        let mut child = ContentRecord::new(key(), "V".into(), false);
        child.parent_category_id = Some("U".into());
        fixture.store.put_content(&child)?;
        let originating = SatelliteRecord::originating(
            key(),
            SatelliteKind::Localization,
            "U".into(),
            "K",
            json!("Hello"),
        );
        fixture.store.insert_originating(&originating)?;
        fixture.store.create_copy(&originating.copy_for(&"V".into()))?;

        let sink = TracingAuditSink;
        let mut coordinator = coordinator_for(&mut fixture.store, &sink);
        let outcome = coordinator.remove_node(
            &key(),
            RemoveNode { target: RemoveTarget::Content("U".into()), purge: false },
        )?;
        drop(coordinator);

        assert_eq!(outcome.status, MutationStatus::Applied);
        assert_eq!(outcome.placement_id, None);
        assert_eq!(outcome.affected, ids(&["U", "V"]));
        assert!(fixture.record("U").removed);
        assert!(fixture.record("V").removed);
        assert!(fixture.copies_on("V").is_empty());
        assert_eq!(fixture.store.satellites().len(), 1);
        Ok(())
    }

    #[test]
    fn update_config_refreshes_descendant_snapshots() -> Result<(), TreeError> {
        let (mut fixture, ..) = abe();
        let sink = TracingAuditSink;
        let mut coordinator = coordinator_for(&mut fixture.store, &sink);
        let outcome = coordinator.update_config(
            &key(),
            UpdateConfig {
                content_id: "A".into(),
                local_config: json!({"x": 1}),
                category_config: Some(json!({"x": 9})),
            },
        )?;
        drop(coordinator);

        assert_eq!(outcome.affected, ids(&["B", "E"]));
        let snapshot = inherited_config(&fixture.store, &key(), &"E".into())?;
        assert_eq!(snapshot[0], InheritedConfig { source_id: "A".into(), config: json!({"x": 9}) });
        Ok(())
    }

    #[test]
    fn removing_originating_satellite_deletes_its_copies() -> Result<(), TreeError> {
        let (mut fixture, ..) = abe();
        fixture.localize("A", "K");
        fixture.localize("A", "Q");

        let sink = TracingAuditSink;
        let mut coordinator = coordinator_for(&mut fixture.store, &sink);
        let outcome = coordinator.remove_originating_satellite(
            &key(),
            SatelliteKind::Localization,
            &"A".into(),
            "K",
        )?;
        let again = coordinator.remove_originating_satellite(
            &key(),
            SatelliteKind::Localization,
            &"A".into(),
            "K",
        )?;
        drop(coordinator);

        assert_eq!(outcome.satellites.deleted, 3);
        assert_eq!(again.status, MutationStatus::NoOp);
        assert_eq!(fixture.copies_on("E"), vec![("A".to_string(), "Q".to_string())]);
        Ok(())
    }

    #[test]
    fn audit_records_applied_mutations_only() -> Result<(), TreeError> {
        let (mut fixture, a, b, _) = abe();
        let sink = RecordingSink::default();
        let mut coordinator = coordinator_for(&mut fixture.store, &sink);
        coordinator.move_node(&key(), MoveNode { placement_id: b, new_parent: a })?;
        let stray = MoveNode { placement_id: PlacementId::new(), new_parent: a };
        coordinator.move_node(&key(), stray)?;
        coordinator.refresh(&key(), &ids(&["E"]))?;
        drop(coordinator);

        let entries = sink.entries.borrow();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].mutation, MutationKind::Move);
        assert_eq!(entries[0].operator, "tester");
        assert_eq!(entries[0].content_id, ContentId::from("B"));
        Ok(())
    }

    #[test]
    fn audit_failure_does_not_fail_the_mutation() -> Result<(), TreeError> {
        let (mut fixture, _, b, _) = abe();
        let root = fixture.root;
        let sink = BrokenSink;
        let mut coordinator = coordinator_for(&mut fixture.store, &sink);
        let outcome =
            coordinator.move_node(&key(), MoveNode { placement_id: b, new_parent: root })?;
        assert_eq!(outcome.status, MutationStatus::Applied);
        Ok(())
    }

    #[test]
    fn blank_operator_is_rejected() {
        let mut store = MemoryStore::default();
        let sink = TracingAuditSink;
        let result = MutationCoordinator::new(&mut store, EngineConfig::default(), &sink, "  ");
        assert!(matches!(result, Err(TreeError::Validation(_))));
    }

    #[test]
    fn init_twice_is_rejected() {
        let mut fixture = Fixture::new();
        let sink = TracingAuditSink;
        let mut coordinator = coordinator_for(&mut fixture.store, &sink);
        assert!(matches!(
            coordinator.init_hierarchy(&key(), "root".into()),
            Err(TreeError::Validation(_))
        ));
    }
}
